use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error("Configuration file not found: {path}")]
    #[diagnostic(
        code(config::not_found),
        help("Pass an existing file to --config, or place modlist-kit.toml next to the executable")
    )]
    ConfigNotFound { path: Utf8PathBuf },

    #[error("Configuration file error in {path}")]
    #[diagnostic(
        code(config::parse_error),
        help("Check the file for TOML syntax errors and unknown keys")
    )]
    ConfigParseError {
        path: Utf8PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Could not determine a cache directory")]
    #[diagnostic(
        code(config::no_cache_dir),
        help("Set cache_dir in modlist-kit.toml")
    )]
    NoCacheDir,

    #[error("{count} installed files could not be matched")]
    #[diagnostic(
        code(compile::unresolved),
        help("Add the archives these files came from to the downloads directory, or ignore them with --ignore")
    )]
    UnresolvedFiles { count: usize },

    #[error("{count} files failed to install")]
    #[diagnostic(
        code(install::failed),
        help("Run the install again once the listed archives are available; files already in place are skipped")
    )]
    InstallFailed { count: usize },

    #[error(transparent)]
    #[diagnostic(code(compile::error))]
    Compile(#[from] mlk_compiler::Error),

    #[error(transparent)]
    #[diagnostic(code(install::error))]
    Install(#[from] mlk_installer::Error),

    #[error(transparent)]
    #[diagnostic(
        code(recipe::error),
        help("Make sure the file is a recipe package written by modlist-kit")
    )]
    Recipe(#[from] mlk_recipe::Error),

    #[error(transparent)]
    #[diagnostic(code(vfs::error))]
    Vfs(#[from] mlk_vfs::Error),

    #[error(transparent)]
    #[diagnostic(code(patch::error))]
    Patch(#[from] mlk_patch::Error),

    #[error("IO operation failed")]
    #[diagnostic(code(io::operation_failed))]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

impl CliError {
    pub fn config_parse_error(
        path: Utf8PathBuf,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConfigParseError {
            path,
            source: Box::new(source),
        }
    }
}
