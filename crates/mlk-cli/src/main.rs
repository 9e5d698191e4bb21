use camino::Utf8PathBuf;
use clap::builder::{styling::AnsiColor, Styles};
use clap::ColorChoice;
use clap::{CommandFactory, FromArgMatches, Parser, Subcommand};
use commands::{
    compile_modlist, inspect_recipe, install_modlist, show_config, CompileModlistArgs,
    InspectRecipeArgs, InstallModlistArgs,
};
use miette::Result;
use tracing_subscriber::EnvFilter;

mod commands;
mod errors;
mod utils;

const DEFAULT_LOG_FILTER: &str = "modlist_kit=info,mlk_compiler=info,mlk_installer=info,mlk_vfs=info";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a modlist-kit.toml configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile an installed setup into a recipe package
    Compile {
        /// The installed setup to describe
        source_dir: String,

        /// The archive pool; defaults to <SOURCE_DIR>/downloads
        #[arg(short, long)]
        downloads_dir: Option<String>,

        /// Where to write the recipe package; defaults to <NAME>.mlk
        #[arg(short, long)]
        output: Option<String>,

        /// A TOML file with compiler settings (ignore rules, merges, ...)
        #[arg(short, long)]
        profile: Option<String>,

        /// Display name of the modlist
        #[arg(short, long)]
        name: Option<String>,

        /// Game identifier recorded in the recipe
        #[arg(short, long)]
        game: Option<String>,

        #[arg(long)]
        author: Option<String>,

        /// Version of the modlist
        #[arg(long = "list-version")]
        list_version: Option<String>,

        /// Game installation, tokenized out of config files
        #[arg(long)]
        game_dir: Option<String>,

        /// Ignore installed paths starting with this prefix (repeatable)
        #[arg(long)]
        ignore: Vec<String>,

        /// Inline installed paths matching this regex (repeatable)
        #[arg(long)]
        include: Vec<String>,

        /// Largest file, in bytes, that may be stored in the recipe
        #[arg(long)]
        max_inline_size: Option<u64>,

        /// Do not match re-encoded textures by similarity
        #[arg(long)]
        no_texture_matching: bool,
    },
    /// Rebuild a setup from a recipe package
    Install {
        /// The recipe package
        package: String,

        /// Where to rebuild the setup
        install_dir: String,

        /// Where archives are found and downloaded; defaults to <INSTALL_DIR>/downloads
        #[arg(short, long)]
        downloads_dir: Option<String>,

        /// Game installation, substituted into config files
        #[arg(long)]
        game_dir: Option<String>,

        /// A directory to copy missing archives from (repeatable)
        #[arg(short, long)]
        mirror: Vec<String>,

        /// Rewrite files even if they are already in place
        #[arg(short, long)]
        force: bool,

        /// Leave files the modlist does not produce in the install directory
        #[arg(long)]
        keep_stale: bool,
    },
    /// Show information about a recipe package
    Inspect {
        /// The path to the recipe package
        file_path: String,

        /// Print the full recipe as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the active configuration
    Config,
}

fn parse_args() -> Result<Args> {
    // Configure colored/styled help output
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default().bold())
        .usage(AnsiColor::Green.on_default().bold())
        .literal(AnsiColor::Cyan.on_default())
        .placeholder(AnsiColor::Blue.on_default());

    let matches = Args::command()
        .styles(styles)
        .color(ColorChoice::Auto)
        .get_matches();

    Args::from_arg_matches(&matches).map_err(|e| miette::miette!("{}", e))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let args = parse_args()?;
    let config_path = args.config.map(Utf8PathBuf::from);
    let cfg = utils::config::load_config(config_path.as_deref())?;

    match args.command {
        Commands::Compile {
            source_dir,
            downloads_dir,
            output,
            profile,
            name,
            game,
            author,
            list_version,
            game_dir,
            ignore,
            include,
            max_inline_size,
            no_texture_matching,
        } => compile_modlist(
            CompileModlistArgs {
                source_dir,
                downloads_dir,
                output,
                profile,
                name,
                game,
                author,
                version: list_version,
                game_dir,
                ignore,
                include,
                max_inline_size,
                no_texture_matching,
            },
            &cfg,
        ),
        Commands::Install {
            package,
            install_dir,
            downloads_dir,
            game_dir,
            mirror,
            force,
            keep_stale,
        } => install_modlist(
            InstallModlistArgs {
                package,
                install_dir,
                downloads_dir,
                game_dir,
                mirrors: mirror,
                force,
                keep_stale,
            },
            &cfg,
        ),
        Commands::Inspect { file_path, json } => inspect_recipe(InspectRecipeArgs { file_path, json }),
        Commands::Config => show_config(&cfg, config_path.as_deref()),
    }
}
