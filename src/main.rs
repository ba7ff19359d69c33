mod app;
mod assembler;
mod cli;
mod config;
mod error;
mod events;
mod job;
mod output;
mod patterns;
mod progress;
mod rules;
mod settings;
mod walker;
mod watcher;

use std::io::{IsTerminal, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use app::{App, GenerateOptions};
use cli::{Cli, Commands, PromptAction, RulesAction};
use events::{AppEvent, EventReceiver};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (app, mut events) = App::new(cli.config_dir.as_deref());

    match cli.command {
        Commands::Tree { path, json } => {
            let root = canonical_root(&path)?;
            let tree = app.list_files(&root).await?;
            output::print_tree(&tree, json)?;
        }

        Commands::Generate {
            paths,
            exclude,
            output,
            max_bytes,
            no_gitignore,
            no_custom_ignore,
            quiet,
        } => {
            app.set_use_gitignore(!no_gitignore).await?;
            app.set_use_custom_ignore(!no_custom_ignore).await?;
            let roots = paths
                .iter()
                .map(|p| canonical_root(p))
                .collect::<Result<Vec<_>>>()?;
            let options = GenerateOptions {
                exclude,
                max_output_bytes: max_bytes,
            };
            let job = app.request_generation(&roots, &options);
            debug!("requested generation job {job}");
            let artifact = wait_for_artifact(&app, &mut events, quiet).await?;
            write_artifact(output.as_deref(), &artifact)?;
        }

        Commands::Watch {
            path,
            no_gitignore,
            no_custom_ignore,
        } => {
            app.set_use_gitignore(!no_gitignore).await?;
            app.set_use_custom_ignore(!no_custom_ignore).await?;
            let root = canonical_root(&path)?;
            app.start_watcher(&root).await?;
            eprintln!("watching {} (Ctrl-C to stop)", root.display());
            watch_loop(&mut events).await?;
            app.stop_watcher().await;
        }

        Commands::Rules { action } => match action {
            RulesAction::Show => print!("{}", app.custom_ignore_rules()),
            RulesAction::Set { source } => {
                let rules = read_source(&source)?;
                app.set_custom_ignore_rules(&rules).await?;
                let path = app.settings_path();
                eprintln!("custom ignore rules saved to {}", path.display());
            }
            RulesAction::Reset => {
                app.set_custom_ignore_rules(patterns::DEFAULT_CUSTOM_IGNORE_RULES)
                    .await?;
                eprintln!("custom ignore rules reset to defaults");
            }
        },

        Commands::Prompt { action } => match action {
            PromptAction::Show => println!("{}", app.custom_prompt_rules()),
            PromptAction::Set { source } => {
                let rules = read_source(&source)?;
                app.set_custom_prompt_rules(&rules)?;
                let path = app.settings_path();
                eprintln!("custom prompt rules saved to {}", path.display());
            }
        },
    }

    app.shutdown().await;
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn canonical_root(path: &Path) -> Result<PathBuf> {
    let root = path
        .canonicalize()
        .with_context(|| format!("cannot access {}", path.display()))?;
    if !root.is_dir() {
        bail!("not a directory: {}", path.display());
    }
    Ok(root)
}

/// Pump job events until the job ends. Ctrl-C cancels the job and waits for
/// its cancellation notice.
async fn wait_for_artifact(app: &App, events: &mut EventReceiver, quiet: bool) -> Result<String> {
    let show_progress = !quiet && std::io::stderr().is_terminal();
    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                app.generator().cancel_current();
                continue;
            }
        };
        let Some(event) = event else {
            bail!("event channel closed before the job finished");
        };

        match event {
            AppEvent::Progress { progress, .. } => {
                if show_progress {
                    eprint!("\rprocessing {}/{}", progress.current, progress.total);
                }
            }
            AppEvent::Generated { artifact, .. } => {
                if show_progress {
                    eprintln!();
                }
                return Ok(artifact);
            }
            AppEvent::Error { message, .. } => {
                if show_progress {
                    eprintln!();
                }
                bail!(message);
            }
            AppEvent::Cancelled {
                message, partial, ..
            } => {
                if let Some(partial) = partial {
                    print!("{partial}");
                    std::io::stdout().flush()?;
                }
                bail!(message);
            }
            AppEvent::FilesChanged { .. } => {}
        }
    }
}

async fn watch_loop(events: &mut EventReceiver) -> Result<()> {
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Some(AppEvent::FilesChanged { root }) => {
                    writeln!(stdout, "{}", root.display())?;
                    stdout.flush()?;
                }
                Some(_) => {}
                None => return Ok(()),
            },
        }
    }
}

fn write_artifact(output: Option<&Path>, artifact: &str) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, artifact)
            .with_context(|| format!("failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout();
            stdout.write_all(artifact.as_bytes())?;
            stdout.flush()?;
            Ok(())
        }
    }
}

/// Read rule text from a file, or from stdin for `-`.
fn read_source(source: &Path) -> Result<String> {
    if source == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(source).with_context(|| format!("failed to read {}", source.display()))
}
