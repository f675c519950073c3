use clap::{value_parser, Arg, ArgAction, Command};
use tracing_subscriber::EnvFilter;
use wave_core::{chunk_count, plan_chunks};
use wave_kernel::test_harness::{run_simulator, SimulatorConfig};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Command::new("wave-kernel")
        .version(wave_kernel::VERSION)
        .about("Wave batch research kernel")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run one batch against seeded fake collaborators")
                .arg(
                    Arg::new("targets")
                        .long("targets")
                        .default_value("25")
                        .value_parser(value_parser!(usize))
                        .help("Number of targets in the batch"),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .default_value("5")
                        .value_parser(value_parser!(usize))
                        .help("Wave size"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.1")
                        .value_parser(value_parser!(f64))
                        .help("Share of targets whose agent always fails"),
                )
                .arg(
                    Arg::new("slots")
                        .long("slots")
                        .default_value("5")
                        .value_parser(value_parser!(usize))
                        .help("Worker slots for the simulated user"),
                )
                .arg(
                    Arg::new("schema")
                        .long("schema")
                        .action(ArgAction::SetTrue)
                        .help("Capture structured values behind the review gate"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print the report as JSON"),
                ),
        )
        .subcommand(
            Command::new("chunks")
                .about("Print the wave plan for a batch")
                .arg(
                    Arg::new("targets")
                        .long("targets")
                        .required(true)
                        .value_parser(value_parser!(usize))
                        .help("Number of targets"),
                )
                .arg(
                    Arg::new("concurrency")
                        .long("concurrency")
                        .required(true)
                        .value_parser(value_parser!(usize))
                        .help("Wave size"),
                ),
        );

    let matches = cli.get_matches();
    init_tracing(matches.get_flag("log-json"));

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = SimulatorConfig {
                seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
                targets: args.get_one::<usize>("targets").copied().unwrap_or(25),
                concurrency: args.get_one::<usize>("concurrency").copied().unwrap_or(5),
                failure_rate: args.get_one::<f64>("failure-rate").copied().unwrap_or(0.1),
                schema: args.get_flag("schema"),
                worker_slots: args.get_one::<usize>("slots").copied().unwrap_or(5),
            };
            let json = args.get_flag("json");
            if !json {
                println!("Running Wave simulator...");
                println!("Targets: {}", config.targets);
                println!("Concurrency: {}", config.concurrency);
                println!("Seed: {}", config.seed);
                println!();
            }

            let report = run_simulator(config).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.generate_text());
            }
            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Some(("chunks", args)) => {
            let total = args.get_one::<usize>("targets").copied().unwrap_or(0);
            let limit = args.get_one::<usize>("concurrency").copied().unwrap_or(0);
            let targets: Vec<String> = (1..=total).map(|i| format!("target-{i}")).collect();
            let chunks = plan_chunks(&targets, limit)?;

            println!(
                "{total} targets, wave size {limit}: {} waves",
                chunk_count(total, limit)
            );
            for chunk in &chunks {
                let first = chunk.targets.first().map_or("", String::as_str);
                let last = chunk.targets.last().map_or("", String::as_str);
                println!("  wave {}: {} targets ({first} .. {last})", chunk.index, chunk.len());
            }
        }
        _ => {}
    }
    Ok(())
}
