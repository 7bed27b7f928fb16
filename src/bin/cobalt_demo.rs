//! Minimal embedder: load an app root, run its entry point, drain tasks.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use cobalt::app::{App, AppConfig};
use tracing::error;

/// Run a JS application's entry point under a single runtime and context.
#[derive(Parser, Debug)]
#[command(name = "cobalt-demo", version)]
struct Args {
    /// Directory containing `js/`, `modules/`, and `resources/`.
    app_root: PathBuf,

    /// Entry-point specifier, relative to the app root's `js/` directory.
    #[arg(default_value = "main.js")]
    entry_point: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let app = match App::initialize(AppConfig {
        app_root: args.app_root,
        idle_tasks_enabled: false,
    }) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "failed to initialize app");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match app.create_js_runtime("main") {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to create runtime");
            return ExitCode::FAILURE;
        }
    };

    let entry_point = format!("js/{}", args.entry_point);
    let context = match runtime.create_context("main", "", &entry_point) {
        Some(context) => context,
        None => {
            error!("failed to create context");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.with_isolate_scope(|scope| {
        cobalt::module_loader::load_entry_point(scope, &context, std::path::Path::new(&entry_point))
    });

    if let Err(e) = result {
        error!(error = %e, "entry point failed");
        app.dispose();
        return ExitCode::FAILURE;
    }

    runtime.process_tasks();
    app.dispose();
    ExitCode::SUCCESS
}
