//! Command-line front end of the notebook engine.
//!
//! # Responsibility
//! - Map subcommands onto `NotebookTree` edits and lifecycle operations.
//! - Address items by slash-separated display-name paths below the root.
//! - Report operation phases on stderr, results on stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use notebook_core::{
    init_logging, AppSettings, ExportFormat, ItemId, ItemKind, LifecycleCoordinator,
    NotebookConfig, NotebookTree, OperationHandle, OperationPhase, SettingsStore,
    TransferSummary,
};

#[derive(Parser)]
#[command(
    name = "notebook",
    about = "Manage notebooks: folders, notes, backups and moves",
    author,
    version
)]
struct Cli {
    /// Notebook directory; defaults to the location stored in --settings.
    #[arg(long, global = true, value_name = "PATH")]
    notebook: Option<PathBuf>,
    /// Settings file holding the active notebook location.
    #[arg(long, global = true, value_name = "FILE")]
    settings: Option<PathBuf>,
    /// Engine config (JSON); defaults apply when omitted.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Write logs to this absolute directory.
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the notebook when missing and remember its location.
    Init,
    /// Print the folder/note outline.
    Tree,
    /// Create a folder; the parent must exist.
    Mkdir { path: String },
    /// Create a note, optionally with a body.
    NewNote(NewNoteArgs),
    /// Print a note body.
    Show { path: String },
    /// Rename an item in place.
    Rename { path: String, name: String },
    /// Delete an item and everything below it.
    Rm { path: String },
    /// Move an item under another folder ("" for the root).
    Mv { path: String, folder: String },
    /// Copy a file into the notebook and attach it to a note.
    Attach { note: String, file: PathBuf },
    /// Delete media files nothing references.
    Gc,
    /// Write a backup under DIR/backup_<timestamp>.
    Backup { dir: PathBuf },
    /// Write DIR/auto_backup_<timestamp> when one is due and prune old ones.
    /// DIR defaults to the backup location in --settings.
    AutoBackup { dir: Option<PathBuf> },
    /// Replace the notebook with a backup directory.
    Restore { source: PathBuf },
    /// Export notes as documents.
    Export(ExportArgs),
    /// Import documents from a directory or file.
    Import { source: PathBuf },
    /// Move the notebook to another directory.
    Relocate {
        target: PathBuf,
        #[arg(long)]
        overwrite: bool,
    },
}

#[derive(Args)]
struct NewNoteArgs {
    path: String,
    #[arg(long, conflicts_with = "body_file")]
    body: Option<String>,
    #[arg(long, value_name = "FILE")]
    body_file: Option<PathBuf>,
}

#[derive(Args)]
struct ExportArgs {
    destination: PathBuf,
    #[arg(long, value_enum, default_value = "markdown")]
    format: FormatChoice,
    #[arg(long)]
    overwrite: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatChoice {
    #[value(alias = "md")]
    Markdown,
    #[value(alias = "htm")]
    Html,
}

impl From<FormatChoice> for ExportFormat {
    fn from(choice: FormatChoice) -> Self {
        match choice {
            FormatChoice::Markdown => ExportFormat::Markdown,
            FormatChoice::Html => ExportFormat::Html,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(log_dir) = &cli.log_dir {
        init_logging(notebook_core::default_log_level(), log_dir, true)
            .context("failed to start logging")?;
    }

    let config = match &cli.config {
        Some(path) => NotebookConfig::load(path)?,
        None => NotebookConfig::default(),
    };
    let settings = cli.settings.clone().map(SettingsStore::new);
    let location = resolve_location(cli.notebook.as_deref(), settings.as_ref())?;
    let tree = Arc::new(
        NotebookTree::open(&location, &config)
            .with_context(|| format!("failed to open notebook at {}", location.display()))?,
    );
    let mut coordinator = LifecycleCoordinator::new(Arc::clone(&tree), &config);
    if let Some(settings) = settings.clone() {
        coordinator = coordinator.with_settings(settings);
    }
    info!(
        "event=cli_command module=cli status=start notebook={}",
        location.display()
    );

    match cli.command {
        Commands::Init => {
            if let Some(settings) = &settings {
                let mut saved = settings
                    .load()?
                    .unwrap_or_else(|| AppSettings::new(&location));
                saved.notebook_location = location.clone();
                settings.save(&saved)?;
            }
            println!("notebook ready at {}", location.display());
        }
        Commands::Tree => print_tree(&tree),
        Commands::Mkdir { path } => {
            let (parent, name) = split_parent(&tree, &path)?;
            tree.create_folder(parent, name)?;
        }
        Commands::NewNote(args) => {
            let body = match (args.body, args.body_file) {
                (Some(body), _) => Some(body),
                (None, Some(file)) => Some(
                    std::fs::read_to_string(&file)
                        .with_context(|| format!("failed to read {}", file.display()))?,
                ),
                (None, None) => None,
            };
            let (parent, name) = split_parent(&tree, &args.path)?;
            let note = tree.create_note(parent, name)?;
            if let Some(body) = body {
                tree.set_note_body(note.item_uuid, &body)?;
            }
        }
        Commands::Show { path } => {
            let note = resolve(&tree, &path)?;
            print!("{}", tree.note_body(note)?);
        }
        Commands::Rename { path, name } => {
            tree.rename(resolve(&tree, &path)?, &name)?;
        }
        Commands::Rm { path } => {
            let outcome = tree.delete(resolve(&tree, &path)?)?;
            println!(
                "removed {} items, released {} media files",
                outcome.removed.len(),
                outcome.released_media.len()
            );
        }
        Commands::Mv { path, folder } => {
            let item = resolve(&tree, &path)?;
            tree.move_item(item, resolve(&tree, &folder)?)?;
        }
        Commands::Attach { note, file } => {
            let asset = tree.attach_media(resolve(&tree, &note)?, &file)?;
            println!("{}", asset.file_name);
        }
        Commands::Gc => {
            let released = tree.collect_media_garbage()?;
            println!("released {} media files", released.len());
        }
        Commands::Backup { dir } => {
            let outcome = follow(coordinator.backup(dir)?).await?;
            println!("backup written to {}", outcome.path.display());
        }
        Commands::AutoBackup { dir } => {
            let saved_dir = match &settings {
                Some(settings) => settings.load()?.and_then(|saved| saved.backup_location),
                None => None,
            };
            let Some(dir) = dir.or(saved_dir) else {
                bail!("no backup directory: pass DIR or set backup_location in --settings");
            };
            match coordinator.auto_backup_if_due(dir)? {
                Some(handle) => {
                    let outcome = follow(handle).await?;
                    println!(
                        "backup written to {} ({} old backups pruned)",
                        outcome.backup.path.display(),
                        outcome.pruned.len()
                    );
                }
                None => println!("no backup due"),
            }
        }
        Commands::Restore { source } => {
            let outcome = follow(coordinator.restore_from(source)?).await?;
            println!(
                "restored {} folders, {} notes, {} media files",
                outcome.manifest.folder_count,
                outcome.manifest.note_count,
                outcome.manifest.media_count
            );
        }
        Commands::Export(args) => {
            let handle =
                coordinator.export_notes(args.format.into(), args.destination, args.overwrite)?;
            print_summary("exported", &follow(handle).await?);
        }
        Commands::Import { source } => {
            print_summary("imported", &follow(coordinator.import_notes(source)?).await?);
        }
        Commands::Relocate { target, overwrite } => {
            let outcome = follow(coordinator.relocate(target, overwrite)?).await?;
            println!("notebook moved to {}", outcome.new_root.display());
        }
    }
    Ok(())
}

fn resolve_location(explicit: Option<&Path>, settings: Option<&SettingsStore>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(settings) = settings {
        if let Some(saved) = settings.load()? {
            return Ok(saved.notebook_location);
        }
    }
    bail!("no notebook location: pass --notebook or a --settings file that names one")
}

/// Finds the item at a slash-separated display-name path; "" is the root.
fn resolve(tree: &NotebookTree, path: &str) -> Result<ItemId> {
    let snapshot = tree.snapshot();
    let mut current = snapshot.root_uuid();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        current = snapshot
            .children(current)
            .find(|child| child.display_name == segment)
            .map(|child| child.item_uuid)
            .ok_or_else(|| anyhow!("no item named `{segment}` in path `{path}`"))?;
    }
    Ok(current)
}

fn split_parent<'a>(tree: &NotebookTree, path: &'a str) -> Result<(ItemId, &'a str)> {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => Ok((resolve(tree, parent)?, name)),
        None => Ok((tree.root_id(), trimmed)),
    }
}

fn print_tree(tree: &NotebookTree) {
    let snapshot = tree.snapshot();
    for (path, kind) in snapshot.outline() {
        let indent = "  ".repeat(path.len().saturating_sub(1));
        let name = path.last().map(String::as_str).unwrap_or_default();
        match kind {
            ItemKind::Folder => println!("{indent}{name}/"),
            ItemKind::Note => println!("{indent}{name}"),
        }
    }
}

fn print_summary(verb: &str, summary: &TransferSummary) {
    println!(
        "{verb} {} notes ({} skipped, {} failed): {}",
        summary.succeeded,
        summary.skipped,
        summary.failed,
        summary.output.display()
    );
}

/// Waits for an operation, echoing phase changes to stderr.
async fn follow<T>(handle: OperationHandle<T>) -> Result<T> {
    let kind = handle.kind().as_str();
    let mut last_phase = OperationPhase::Idle;
    let result = handle
        .wait_with_progress(|progress| {
            if progress.phase != last_phase {
                last_phase = progress.phase;
                eprintln!("{kind}: {}", progress.phase.as_str());
            }
        })
        .await;
    result.map_err(|err| anyhow!(err).context(format!("{kind} failed")))
}
