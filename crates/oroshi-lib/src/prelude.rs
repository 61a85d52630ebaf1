pub use crate::models::{ChapterInfo, MangaDetails, PageChunk, SourceInfo};
pub use crate::traits::Extension;
