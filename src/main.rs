use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use wireit::analyzer::Analyzer;
use wireit::cache::{Cache, LocalCache};
use wireit::cli::Cli;
use wireit::config::{CacheMode, Options};
use wireit::deferred::Deferred;
use wireit::executor::Executor;
use wireit::logging;
use wireit::pool::WorkerPool;
use wireit::reporter::Reporter;
use wireit::watcher;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    logging::init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let options = match Options::from_env(&cli) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("\u{274c} {err:#}");
            return 1;
        }
    };

    let cwd = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from(&options.script.package_dir));

    if options.watch {
        let abort: Deferred<()> = Deferred::new();
        {
            let abort = abort.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    abort.resolve(());
                }
            });
        }
        watcher::watch(&options, &cwd, abort).await
    } else {
        run_once(&options, &cwd).await
    }
}

async fn run_once(options: &Options, cwd: &std::path::Path) -> i32 {
    let analysis = match Analyzer::new().analyze(&options.script) {
        Err((analyzer, diagnostics)) => {
            let printer = analyzer.printer(cwd);
            for diagnostic in &diagnostics {
                printer.print(diagnostic);
            }
            return 1;
        }
        Ok(analysis) => Arc::new(analysis),
    };

    let reporter = Reporter::new(&analysis.root_package);
    let cache: Option<Arc<dyn Cache>> = match options.cache {
        CacheMode::Local => Some(Arc::new(LocalCache::new())),
        CacheMode::None => None,
    };

    let executor = Executor::new(
        analysis,
        WorkerPool::new(options.parallelism),
        cache,
        options.failure_mode,
        reporter.clone(),
    );

    // External abort: interrupting the host process kills in-flight scripts
    // and winds down services.
    {
        let executor = executor.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                executor.abort();
            }
        });
    }

    match executor.execute_top_level().await {
        Ok(summary) => {
            reporter.summary(summary.ran, summary.fresh, summary.cached, 0);
            0
        }
        Err(failures) => {
            reporter.summary(0, 0, 0, failures.len());
            1
        }
    }
}
