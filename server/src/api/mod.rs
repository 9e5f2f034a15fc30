pub mod rest;

use crate::config::Config;
use crate::pad::TextPad;
use crate::storage::{DirectoryLister, RangeFileServer, Root, UploadIntake};

#[derive(Clone)]
pub struct AppState {
    pub root: Root,
    pub lister: DirectoryLister,
    pub intake: UploadIntake,
    pub files: RangeFileServer,
    /// Shared text snippets
    pub pad: TextPad,
    pub config: Config,
}

impl AppState {
    pub fn new(root: Root, intake: UploadIntake, config: Config) -> Self {
        Self {
            lister: DirectoryLister::new(root.clone(), config.date_format.clone()),
            files: RangeFileServer::new(root.clone(), config.max_chunk_size),
            root,
            intake,
            pad: TextPad::default(),
            config,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state(root: &std::path::Path, overwrite: bool) -> AppState {
    let mut config = Config::from_lookup(|_| None).unwrap();
    config.root = root.to_path_buf();
    config.overwrite = overwrite;
    let root = Root::open(root).unwrap();
    let intake = UploadIntake::new(root.clone(), overwrite);
    AppState::new(root, intake, config)
}
