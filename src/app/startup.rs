use super::cli::args::{Args, Command};
use super::cli::config::BrokerConfig;
use super::report::print_report;
use super::simulate::{self, SimulationPlan};
use crate::core::error_handling::log_error_with_context;
use crate::core::logging::init_logging;
use crate::core::version::long_version;

/// Parse arguments, build the runtime and run the selected command
///
/// Returns the process exit code.
pub fn startup() -> i32 {
    let args = Args::parse_styled();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            return 1;
        }
    };

    runtime.block_on(run(args))
}

async fn run(args: Args) -> i32 {
    let config = match BrokerConfig::load(args.config_file.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    // Command line wins over the [logging] section
    let logging = &config.logging;
    let use_color = args.use_color(logging.color);
    let log_level = args.log_level.as_deref().unwrap_or(&logging.level);
    let log_format = args.log_format.as_deref().unwrap_or(&logging.format);
    let log_file = match &args.log_file {
        Some(path) => Some(path.to_string_lossy().into_owned()),
        None => logging.file.clone(),
    };
    if let Err(e) = init_logging(Some(log_level), Some(log_format), log_file.as_deref(), use_color) {
        eprintln!("Failed to initialise logging: {}", e);
        return 1;
    }
    log::info!("brokerqueue {} starting", long_version());

    match &args.command {
        Command::Simulate(simulate_args) => {
            let plan = SimulationPlan::from(simulate_args);
            match simulate::run(&config, &plan).await {
                Ok(report) => {
                    print_report(&report, use_color);
                    0
                }
                Err(e) => {
                    log_error_with_context(&e, "Simulation failed");
                    1
                }
            }
        }
    }
}
