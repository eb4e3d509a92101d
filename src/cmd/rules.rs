use vigil::pipeline::Pipeline;
use clap::{Args, Subcommand};
use notify::Watcher;
use vigil_rules::NullBpfCompiler;

/// Inspect, validate and hot-reload the rule configuration.
#[derive(Args, Debug)]
pub struct Command {
    #[command(subcommand)]
    inner: RulesCommands,
}

#[derive(Debug, Subcommand)]
enum RulesCommands {
    /// Load and compile the configured rule files, then print a summary.
    Check,
    /// Keep the rules loaded and reload them whenever a file changes.
    Watch,
}

impl Command {
    pub async fn run(&self, config: vigil::config::Config) {
        match self.inner {
            RulesCommands::Check => check(config),
            RulesCommands::Watch => watch(config).await,
        }
    }
}

fn load_or_exit(pipeline: &Pipeline) -> usize {
    match pipeline.load_rules(&NullBpfCompiler) {
        Ok(count) => count,
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    }
}

fn check(config: vigil::config::Config) {
    let pipeline = Pipeline::new(&config);
    let count = load_or_exit(&pipeline);
    println!("{count} rules loaded");
    for stats in pipeline.engine().stats() {
        println!("{:<35} {}", stats.source, stats.name);
    }
}

fn print_stats(pipeline: &Pipeline) {
    let mut header = false;
    for stats in pipeline.engine().stats() {
        if stats.matched == 0 {
            continue;
        }
        if !header {
            println!("{:<35} {:<30} {}", "File", "Rule", "Matched");
            header = true;
        }
        println!("{:<35} {:<30} {}", stats.source, stats.name, stats.matched);
    }
}

async fn watch(config: vigil::config::Config) {
    let pipeline = Pipeline::new(&config);
    let count = load_or_exit(&pipeline);
    tracing::info!("watching {} rule files ({count} rules)", config.rules_files.len());

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(event) = event {
            if event.kind.is_modify() || event.kind.is_create() {
                let _ = tx.send(());
            }
        }
    })
    .expect("unable to create file watcher");

    for file in config.rules_files.iter() {
        if let Err(error) = watcher.watch(file, notify::RecursiveMode::NonRecursive) {
            tracing::warn!("unable to watch {file:?}: {error:?}");
        }
    }

    loop {
        tokio::select! {
            _ = rx.recv() => {
                match pipeline.load_rules(&NullBpfCompiler) {
                    Ok(count) => tracing::info!("reloaded {count} rules"),
                    Err(error) => tracing::error!("reload failed, keeping previous rules: {error}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    print_stats(&pipeline);
}
