mod replay;
mod retry;
mod scripted;

pub use replay::ReplayChatModel;
pub use retry::{RetryChatModel, RetryPolicy};
pub use scripted::ScriptedChatModel;
