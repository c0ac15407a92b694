use std::path::PathBuf;
use std::sync::Arc;
use webauto_lib::state::AppState;
use webauto_lib::workflow::{self, PlanExecutor};

fn usage() -> ! {
    eprintln!("Usage:");
    eprintln!("  webauto serve               Start the unified API and browser service");
    eprintln!("  webauto run <plan.json>     Execute a workflow plan");
    eprintln!("  webauto validate            Validate the container library");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    // Never overwrite an existing config file on a failed load.
    let config = match webauto_lib::config::load_config() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}. Using in-memory defaults.", e);
            let mut c = webauto_lib::config::AppConfig::default();
            c.apply_env();
            c
        }
    };

    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("serve") => {
            if let Err(e) = webauto_lib::run_service(config).await {
                eprintln!("SERVICE_FAILED: {}", e);
                std::process::exit(1);
            }
        }
        Some("run") => {
            let path = args.get(2).map(PathBuf::from).unwrap_or_else(|| usage());
            let plan = match workflow::load_plan(&path) {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("{}: {}", e.code(), e);
                    std::process::exit(1);
                }
            };

            let state = Arc::new(AppState::new(config));
            let (mut executor, cancel) = PlanExecutor::new(Arc::clone(&state));

            // Ctrl-C cancels the plan; blocks get their grace window.
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, cancelling plan");
                    cancel.cancel();
                }
            });

            let run = executor.execute(&plan).await;
            match serde_json::to_string_pretty(&run) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("Failed to render run result: {}", e),
            }
            if run.status != workflow::ExecutionStatus::Completed {
                if let Some(error) = &run.error {
                    eprintln!("{}", error);
                }
                std::process::exit(1);
            }
        }
        Some("validate") => {
            let dir = config.containers_dir();
            match webauto_lib::container::ContainerRegistry::load_dir(&dir) {
                Ok(registry) => {
                    println!(
                        "ok: {} roots, {} containers",
                        registry.roots().len(),
                        registry.len()
                    );
                }
                Err(e) => {
                    eprintln!("{}: {}", e.code(), e);
                    std::process::exit(1);
                }
            }
        }
        _ => usage(),
    }
}
