//! obdsim - simulated ELM327 adapter
//!
//! ```bash
//! obdsim -g Cycle -s 20,5 -g Error -d 40 -p 6
//! ```
//!
//! Without `--tty-device` or `--tcp-port` a pseudo-terminal is created and
//! its path logged; point the logger at it like a real adapter.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use obd_protocol::{ObdProtocol, ProtocolSelection};
use obd_sim::{
    create_generator, init_logging, open_tty, AdapterIdentity, Ecu, EcuSet, ResponderEngine,
    SimPort, SimSettings, TcpPort, DEFAULT_ELM_DEVICE, DEFAULT_ELM_VERSION, DEFAULT_GENERATOR,
    GENERATORS,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "obdsim", version)]
#[command(about = "Simulated ELM327 OBD-II adapter")]
struct Args {
    /// Value source for one simulated ECU; repeat for more ECUs
    #[arg(short, long, value_name = "NAME")]
    generator: Vec<String>,

    /// Seed for the most recent generator
    #[arg(short, long)]
    seed: Vec<String>,

    /// Reply delay in ms for the most recent generator
    #[arg(short, long, value_name = "MS")]
    delay: Vec<u64>,

    /// Protocol number, optionally marked automatic with `A`
    #[arg(short, long, default_value = "8")]
    protocol: String,

    /// Reply to ATI, ATZ and ATWS
    #[arg(long, default_value = DEFAULT_ELM_VERSION)]
    elm_version: String,

    /// Reply to AT@1
    #[arg(long, default_value = DEFAULT_ELM_DEVICE)]
    elm_device: String,

    /// Serve on a real serial device instead of a pseudo-terminal
    #[arg(short, long)]
    tty_device: Option<String>,

    /// Serve on a TCP port instead of a pseudo-terminal
    #[arg(short = 'T', long)]
    tcp_port: Option<u16>,

    /// Log throughput every N seconds
    #[arg(short, long, value_name = "SECS")]
    benchmark: Option<u64>,

    /// List available generators
    #[arg(short, long)]
    list_generators: bool,

    /// Print the long description of every generator
    #[arg(short = 'e', long)]
    generator_help: bool,

    /// List supported protocols
    #[arg(long)]
    list_protocols: bool,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Index of the generator an option at `index` belongs to: the last one
/// given before it, or the first if none was.
fn owner(generator_indices: &[usize], index: usize) -> usize {
    generator_indices
        .iter()
        .rposition(|&g| g < index)
        .unwrap_or(0)
}

fn indices(matches: &ArgMatches, id: &str) -> Vec<usize> {
    matches
        .indices_of(id)
        .map(|i| i.collect())
        .unwrap_or_default()
}

fn build_ecus(matches: &ArgMatches, args: &Args) -> Result<Vec<Ecu>> {
    let mut names = args.generator.clone();
    if names.is_empty() {
        names.push(DEFAULT_GENERATOR.to_string());
    }
    let generator_indices = indices(matches, "generator");

    let mut seeds = vec![String::new(); names.len()];
    for (seed, index) in args.seed.iter().zip(indices(matches, "seed")) {
        seeds[owner(&generator_indices, index)].clone_from(seed);
    }
    let mut delays = vec![0u64; names.len()];
    for (delay, index) in args.delay.iter().zip(indices(matches, "delay")) {
        delays[owner(&generator_indices, index)] = *delay;
    }

    names
        .iter()
        .zip(seeds.iter().zip(delays))
        .enumerate()
        .map(|(address, (name, (seed, delay)))| -> Result<Ecu> {
            let source = create_generator(name, seed)?;
            info!(
                "ECU {}: {} seed {:?}, {}ms delay",
                address,
                source.name(),
                seed,
                delay
            );
            Ok(Ecu::new(address as u8, Duration::from_millis(delay), source))
        })
        .collect()
}

async fn serve<P: SimPort>(
    port: P,
    ecus: EcuSet,
    settings: SimSettings,
    identity: AdapterIdentity,
    benchmark: Option<u64>,
) -> Result<()> {
    let mut engine = ResponderEngine::new(port, ecus, settings, identity);
    if let Some(secs) = benchmark {
        engine = engine.with_benchmark(Duration::from_secs(secs));
    }
    engine.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches)?;
    init_logging(args.verbose, args.log_json)
        .map_err(|e| anyhow!("Failed to set tracing subscriber: {}", e))?;

    if args.list_generators || args.generator_help {
        for generator in &GENERATORS {
            if args.generator_help {
                println!("{}\n{}\n", generator.name, generator.description);
            } else {
                let summary = generator.description.lines().next().unwrap_or_default();
                println!("{:<8} {}", generator.name, summary);
            }
        }
        return Ok(());
    }
    if args.list_protocols {
        for protocol in ObdProtocol::ALL {
            println!("{}  {}", protocol.number(), protocol.description());
        }
        return Ok(());
    }

    let protocol: ProtocolSelection = args.protocol.parse()?;
    let ecus = EcuSet::new(build_ecus(&matches, &args)?)?;
    let settings = SimSettings::with_protocol(protocol);
    let identity = AdapterIdentity {
        version: args.elm_version.clone(),
        device: args.elm_device.clone(),
    };

    info!("=== obdsim v{} ===", env!("CARGO_PKG_VERSION"));

    if let Some(path) = &args.tty_device {
        let port = open_tty(path).with_context(|| format!("opening {}", path))?;
        return serve(port, ecus, settings, identity, args.benchmark).await;
    }
    if let Some(tcp_port) = args.tcp_port {
        let port = TcpPort::bind(tcp_port).await?;
        return serve(port, ecus, settings, identity, args.benchmark).await;
    }

    serve_pty(ecus, settings, identity, args.benchmark).await
}

#[cfg(target_os = "linux")]
async fn serve_pty(
    ecus: EcuSet,
    settings: SimSettings,
    identity: AdapterIdentity,
    benchmark: Option<u64>,
) -> Result<()> {
    let port = obd_sim::PtyPort::open()?;
    println!("SimPort name: {}", port.slave_path());
    serve(port, ecus, settings, identity, benchmark).await
}

#[cfg(not(target_os = "linux"))]
async fn serve_pty(
    _ecus: EcuSet,
    _settings: SimSettings,
    _identity: AdapterIdentity,
    _benchmark: Option<u64>,
) -> Result<()> {
    Err(anyhow!("No pseudo-terminal support here, use --tty-device or --tcp-port"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_follow_their_generator() {
        let matches = Args::command().get_matches_from([
            "obdsim", "-s", "5", "-g", "Cycle", "-g", "Random", "-s", "42", "-d", "30", "-g",
            "Error",
        ]);
        let args = Args::from_arg_matches(&matches).unwrap();
        let generators = indices(&matches, "generator");
        let seed_owners: Vec<usize> = indices(&matches, "seed")
            .into_iter()
            .map(|i| owner(&generators, i))
            .collect();
        assert_eq!(seed_owners, vec![0, 1]);
        assert_eq!(owner(&generators, indices(&matches, "delay")[0]), 1);

        let ecus = build_ecus(&matches, &args).unwrap();
        assert_eq!(ecus.len(), 3);
        assert_eq!(ecus[1].delay, Duration::from_millis(30));
        assert_eq!(ecus[2].source.name(), "Error");
    }

    #[test]
    fn test_default_generator() {
        let matches = Args::command().get_matches_from(["obdsim"]);
        let args = Args::from_arg_matches(&matches).unwrap();
        let ecus = build_ecus(&matches, &args).unwrap();
        assert_eq!(ecus.len(), 1);
        assert_eq!(ecus[0].source.name(), DEFAULT_GENERATOR);
    }

    #[test]
    fn test_unknown_generator_rejected() {
        let matches = Args::command().get_matches_from(["obdsim", "-g", "Nope"]);
        let args = Args::from_arg_matches(&matches).unwrap();
        assert!(build_ecus(&matches, &args).is_err());
    }
}
