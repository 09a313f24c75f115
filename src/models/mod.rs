pub mod channel;
pub mod model_result;
pub mod received_file;
pub mod work_item;

pub use channel::ChannelData;
pub use model_result::ModelResult;
pub use received_file::ReceivedFile;
pub use work_item::{work_item_columns, WorkItem, WorkItemState, WORK_ITEM_COLUMNS};
