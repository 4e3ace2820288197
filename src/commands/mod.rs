//! Console commands: the interactive chat loop and `--list-tools`.

pub mod chat;
pub mod status;
