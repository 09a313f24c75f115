//! Partition a session's files into inference input channels

use crate::error::{GatewayError, Result};
use crate::models::{ChannelData, ReceivedFile};

/// Group files by channel id.
///
/// Channels come out in order of first appearance; files keep receipt order
/// within their channel. A file without a channel fails the whole grouping.
pub fn group_by_channel(files: &[ReceivedFile]) -> Result<Vec<ChannelData>> {
    let mut groups: Vec<ChannelData> = Vec::new();

    for file in files {
        let channel_id = file
            .channel
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                GatewayError::MissingChannel(format!(
                    "{} ({}) carries no channel",
                    file.sop_instance_uid,
                    file.path.display()
                ))
            })?;

        match groups.iter_mut().find(|g| g.channel_id() == channel_id) {
            Some(group) => group.push(&file.path),
            None => groups.push(ChannelData::new(channel_id, vec![file.path.clone()], false)?),
        }
    }

    Ok(groups)
}

/// Fail with `MissingChannel` if any required channel has no group
pub fn ensure_required_channels(groups: &[ChannelData], required: &[String]) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .map(String::as_str)
        .filter(|id| !groups.iter().any(|g| g.channel_id() == *id))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::MissingChannel(format!(
            "required channel(s) not received: {}",
            missing.join(", ")
        )))
    }
}
