pub mod registry;
pub mod ytdlp;
