use crate::println_pad;
use crate::utils::format_size;
use camino::Utf8Path;
use colored::Colorize;
use miette::IntoDiagnostic;
use mlk_recipe::RecipePackage;
use std::collections::BTreeMap;

pub struct InspectRecipeArgs {
    pub file_path: String,
    pub json: bool,
}

pub fn inspect_recipe(args: InspectRecipeArgs) -> miette::Result<()> {
    let file_path = Utf8Path::new(&args.file_path);
    if !file_path.exists() {
        return Err(miette::miette!(
            "File not found: {}\n\nMake sure the path is correct and the file exists.",
            file_path
        ));
    }

    let package = RecipePackage::open(file_path).map_err(crate::errors::CliError::from)?;
    let recipe = package.recipe();

    if args.json {
        let pretty = serde_json::to_string_pretty(recipe).into_diagnostic()?;
        println!("{}", pretty);
        return Ok(());
    }

    println_pad!(
        "{} {}",
        "📜 Recipe:".bright_blue().bold(),
        recipe.name.bright_cyan().bold()
    );
    println_pad!(
        "{} {}",
        "🏷️ Version:".bright_green(),
        recipe.version.bright_white().bold()
    );
    println_pad!("{} {}", "🎮 Game:".bright_green(), recipe.game.bright_white());
    if !recipe.author.is_empty() {
        println_pad!("{} {}", "👤 Author:".bright_green(), recipe.author.bright_white());
    }
    println_pad!(
        "{} {}",
        "📝 Description:".bright_yellow(),
        if recipe.description.is_empty() {
            "No description"
        } else {
            recipe.description.as_str()
        }
        .bright_white()
    );
    println_pad!(
        "{} {} to download, {} installed",
        "💾 Size:".bright_yellow(),
        format_size(recipe.archive_size).bright_white(),
        format_size(recipe.install_size).bright_white()
    );

    let mut by_type: BTreeMap<&str, usize> = BTreeMap::new();
    for directive in &recipe.directives {
        *by_type.entry(directive.type_name()).or_default() += 1;
    }
    println_pad!("\n{}", "🧾 Directives:".bright_magenta().bold());
    for (kind, count) in by_type {
        println_pad!("   {} {} {}", "•".bright_cyan(), kind.bright_cyan().bold(), count);
    }

    println_pad!("\n{}", "📚 Archives:".bright_magenta().bold());
    for archive in &recipe.archives {
        println_pad!(
            "   {} {} {}",
            "•".bright_cyan(),
            archive.name.bright_cyan().bold(),
            format!(
                "({}, {}, {})",
                archive.hash,
                format_size(archive.size),
                archive.state_type().unwrap_or("untyped")
            )
            .dimmed()
        );
    }

    Ok(())
}
