use seggate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args()?;
    seggate::run(config).await
}
