use crate::errors::CliError;
use config::AppConfig;
use mlk_patch::BinaryPatchCache;
use mlk_vfs::{Context, FileHashCache, VfsCache, VfsSettings};
use std::sync::Arc;

pub mod config;

#[macro_export]
macro_rules! println_pad {
    ($($arg:tt)*) => {{
        let __s = format!($($arg)*);
        for __line in __s.lines() {
            println!("    {}", __line);
        }
    }};
}

/// Human-readable byte count.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// The persistent caches shared by compile and install.
pub struct Caches {
    pub vfs: Arc<Context>,
    pub patches: Arc<BinaryPatchCache>,
    tree_cache: Arc<VfsCache>,
    hash_cache: Arc<FileHashCache>,
}

impl Caches {
    pub fn open(cfg: &AppConfig) -> Result<Self, CliError> {
        let dir = cfg.cache_dir()?;
        tracing::info!("Using cache directory {}", dir);

        let tree_cache = Arc::new(VfsCache::open(dir.join("vfs"))?);
        let hash_cache = Arc::new(FileHashCache::open(dir.join("file_hashes.bin"))?);
        let mut settings = VfsSettings {
            workers: cfg.workers,
            ..VfsSettings::default()
        };
        if let Some(depth) = cfg.max_archive_depth {
            settings.max_depth = depth;
        }
        let vfs = Context::new(tree_cache.clone(), hash_cache.clone(), settings)?;
        let patches = BinaryPatchCache::open(dir.join("patches"))?;

        Ok(Self {
            vfs: Arc::new(vfs),
            patches: Arc::new(patches),
            tree_cache,
            hash_cache,
        })
    }

    /// Flush and close every cache.
    pub fn close(&self) -> Result<(), CliError> {
        self.hash_cache.close()?;
        self.tree_cache.close()?;
        self.patches.close()?;
        Ok(())
    }
}
