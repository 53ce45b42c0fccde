pub mod chat;
pub mod host;
pub mod manifest;
pub mod match_cmd;
pub mod replay;
