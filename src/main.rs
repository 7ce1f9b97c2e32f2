use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use hypervisor_probe::engine::policy::indicator_visible;
use hypervisor_probe::{CounterSource, DetectorConfig, HypervisorDetector, Monitor, ThreatAnalysis};

#[derive(Debug, Parser)]
#[command(name = "hvprobe", version, about = "Detect a hypervisor beneath this process")]
struct Args {
    /// Number of analyses to run.
    #[arg(short, long, default_value_t = 1)]
    count: usize,

    /// Delay between analyses, in milliseconds.
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Print one JSON object per analysis instead of text.
    #[arg(long)]
    json: bool,

    /// JSON file overriding the default tuning.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Poison the cache when the threat category calls for it.
    #[arg(long)]
    countermeasures: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DetectorConfig::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => DetectorConfig::from_env(),
    };

    if !args.json {
        println!("==================================================");
        println!("        Hypervisor Probe: EL2 Anomaly Scan        ");
        println!("==================================================");
        println!("\n[*] Phase 0: Environment and Counters");
    }

    let mut detector = HypervisorDetector::with_config(config);
    if !detector.initialize() {
        bail!("detector could not be initialized");
    }

    if !args.json {
        println!("[*] Clock source: {:?}", detector.clock().source());
        println!(
            "[*] Performance counters: {:?}{}",
            detector.counters().state(),
            if detector.counters_accessible() { "" } else { " (limited detection)" }
        );
        if let Some(env) = detector.environment() {
            for warning in &env.warnings {
                println!("[!] {}", warning);
            }
        }
        println!("\n[*] Phase 1: Analysis ({} pass(es))", args.count);
    }

    let interval = Duration::from_millis(args.interval_ms);
    let mut monitor = Monitor::new(detector, args.countermeasures);
    for pass in 0..args.count {
        let (analysis, changed) = monitor.step().context("analysis failed")?;
        if args.json {
            println!("{}", serde_json::to_string(&analysis)?);
        } else {
            if changed && pass > 0 {
                println!("[*] Category changed to {:?}", analysis.category());
            }
            print_analysis(&analysis);
        }
        if pass + 1 < args.count {
            thread::sleep(interval);
        }
    }

    if args.json {
        return Ok(());
    }

    let detector = monitor.detector();
    let baseline = detector.baseline();
    println!("\n[*] Baseline");
    println!("    cache latency:       {} ticks", baseline.avg_cache_latency);
    println!("    instruction latency: {} ticks", baseline.avg_instruction_latency);
    println!("    cycles/instruction:  {:.2}", baseline.avg_cycles_per_instruction);
    println!("    cache miss rate:     {:.3}", baseline.avg_cache_miss_rate);

    println!("\n==================================================");
    match monitor.latest() {
        Some(a) => {
            println!("[*] Final category: {:?} ({}%)", a.category(), a.percentage());
            if indicator_visible(a.percentage()) {
                println!("[!] Virtualization indicators present.");
            } else {
                println!("[+] No hypervisor detected.");
            }
        }
        None => println!("[!] No analysis completed."),
    }
    println!("==================================================");
    Ok(())
}

fn print_analysis(a: &ThreatAnalysis) {
    let flag = |set: bool| if set { "!" } else { "-" };
    println!(
        "[{}] threat {:>3}% {:<8} confidence {:.2} | timing {:.2}{} cache {:.2}{} perf {:.2}{} memory {:.2}{}",
        if a.hypervisor_confidence > 0.5 { "!" } else { "+" },
        a.percentage(),
        format!("{:?}", a.category()),
        a.hypervisor_confidence,
        a.scores.timing,
        flag(a.timing_anomaly),
        a.scores.cache,
        flag(a.cache_anomaly),
        a.scores.counter,
        flag(a.counter_blocked),
        a.scores.memory,
        flag(a.memory_anomaly),
    );
}
