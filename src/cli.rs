use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Pack project directories into a single text artifact for LLM prompts.
///
/// ctxpack renders a directory tree followed by the contents of every file
/// that survives `.gitignore`, the custom ignore rules, and explicit
/// exclusions. It can also watch a project and report when files change.
#[derive(Parser, Debug)]
#[command(
    name = "ctxpack",
    version,
    about,
    long_about = None,
    propagate_version = true,
)]
pub struct Cli {
    /// Directory holding settings.json (defaults to the platform config dir).
    #[arg(long, global = true, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Log at debug level (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the directory tree with ignore markers.
    ///
    /// Ignored directories are listed but not expanded.
    Tree {
        /// Project root to list.
        path: PathBuf,

        /// Output the tree as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Assemble the context artifact for one or more project roots.
    ///
    /// With several roots, each non-empty root gets a `=== PROJECT ===` header
    /// and the shared size ceiling truncates the tail instead of failing.
    Generate {
        /// Project roots, in output order.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Path to leave out: relative to every root, or absolute.
        #[arg(short, long, value_name = "PATH")]
        exclude: Vec<String>,

        /// Write the artifact to a file instead of stdout.
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Size ceiling in bytes (default: from ctxpack.toml, else 10000000).
        #[arg(long, value_name = "N")]
        max_bytes: Option<usize>,

        /// Do not apply the project's .gitignore.
        #[arg(long)]
        no_gitignore: bool,

        /// Do not apply the custom ignore rules.
        #[arg(long)]
        no_custom_ignore: bool,

        /// Suppress progress output on stderr.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Watch a project and print its root whenever files change. Stop with Ctrl-C.
    Watch {
        /// Project root to watch.
        path: PathBuf,

        /// Do not apply the project's .gitignore.
        #[arg(long)]
        no_gitignore: bool,

        /// Do not apply the custom ignore rules.
        #[arg(long)]
        no_custom_ignore: bool,
    },

    /// Show or change the custom ignore rules (gitignore syntax).
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Show or change the custom prompt rules.
    Prompt {
        #[command(subcommand)]
        action: PromptAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum RulesAction {
    /// Print the current rules.
    Show,
    /// Replace the rules with the contents of FILE (`-` for stdin).
    Set {
        #[arg(value_name = "FILE")]
        source: PathBuf,
    },
    /// Restore the bundled default rules.
    Reset,
}

#[derive(Subcommand, Debug)]
pub enum PromptAction {
    /// Print the current prompt rules.
    Show,
    /// Replace the prompt rules with the contents of FILE (`-` for stdin).
    Set {
        #[arg(value_name = "FILE")]
        source: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_generate_collects_repeated_excludes() {
        let args = "ctxpack generate a b -e x.txt --exclude /abs/y --max-bytes 10";
        let cli = Cli::try_parse_from(args.split_whitespace()).unwrap();
        match cli.command {
            Commands::Generate {
                paths,
                exclude,
                max_bytes,
                ..
            } => {
                assert_eq!(paths, vec![PathBuf::from("a"), PathBuf::from("b")]);
                assert_eq!(exclude, vec!["x.txt", "/abs/y"]);
                assert_eq!(max_bytes, Some(10));
            }
            other => panic!("expected Generate, got {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = "ctxpack rules show --config-dir /tmp/c -v";
        let cli = Cli::try_parse_from(args.split_whitespace()).unwrap();
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/c")));
        assert!(cli.verbose);
        match cli.command {
            Commands::Rules { action } => assert!(matches!(action, RulesAction::Show)),
            other => panic!("expected Rules, got {other:?}"),
        }
    }
}
