fn main() {
    if let Err(e) = run() {
        eprintln!("lock stress failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use cadence_core::config::ThreadConfig;
    use cadence_core::thread::max_held_rank;
    use cadence_core::{CadenceError, LockRank, ThreadManager};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde::Serialize;

    #[derive(Debug)]
    struct Args {
        threads: usize,
        iterations: usize,
        seed: u64,
        timeout_ms: u64,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Default, Clone)]
    struct ThreadResult {
        acquired: u64,
        order_rejections: u64,
        timeouts: u64,
        /// An out-of-order request that was granted, or an in-order one refused
        /// as out of order. Must stay zero.
        breaches: u64,
        max_rejection_us: u64,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Summary {
        threads: usize,
        iterations: usize,
        seed: u64,
        elapsed_ms: f64,
        acquired: u64,
        order_rejections: u64,
        timeouts: u64,
        breaches: u64,
        max_rejection_us: u64,
        mean_lock_wait_us: f64,
        max_lock_wait_us: u64,
    }

    fn parse_args() -> Result<Args, String> {
        let mut args = Args {
            threads: 8,
            iterations: 10_000,
            seed: 0x5eed,
            timeout_ms: 50,
            output: None,
        };
        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            let mut value = |flag: &str| it.next().ok_or_else(|| format!("missing value for {flag}"));
            match arg.as_str() {
                "--threads" => {
                    args.threads = value("--threads")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --threads".to_string())?
                        .clamp(1, 64);
                }
                "--iterations" => {
                    args.iterations = value("--iterations")?
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --iterations".to_string())?
                        .max(1);
                }
                "--seed" => {
                    args.seed = value("--seed")?
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --seed".to_string())?;
                }
                "--timeout-ms" => {
                    args.timeout_ms = value("--timeout-ms")?
                        .parse::<u64>()
                        .map_err(|_| "invalid value for --timeout-ms".to_string())?
                        .clamp(1, 10_000);
                }
                "--output" => {
                    args.output = Some(PathBuf::from(value("--output")?));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p cadence-core --bin lock_stress -- \\
  [--threads <m>] [--iterations <n>] [--seed <u64>] [--timeout-ms <ms>] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        Ok(args)
    }

    fn worker(
        tm: &ThreadManager,
        rng: &mut StdRng,
        iterations: usize,
        timeout: Duration,
    ) -> ThreadResult {
        let mut result = ThreadResult::default();
        for _ in 0..iterations {
            let mut held = Vec::new();
            let steps = rng.gen_range(1..=4);
            for _ in 0..steps {
                let rank = LockRank::ALL[rng.gen_range(0..LockRank::ALL.len())];
                let must_reject = max_held_rank().is_some_and(|top| rank <= top);
                let started = Instant::now();
                match tm.acquire_named(rank, timeout) {
                    Ok(guard) => {
                        if must_reject {
                            result.breaches += 1;
                        }
                        result.acquired += 1;
                        held.push(guard);
                    }
                    Err(CadenceError::LockOrderViolation { .. }) => {
                        if !must_reject {
                            result.breaches += 1;
                        }
                        result.order_rejections += 1;
                        let us = started.elapsed().as_micros() as u64;
                        result.max_rejection_us = result.max_rejection_us.max(us);
                    }
                    Err(CadenceError::LockTimeout { .. }) => result.timeouts += 1,
                    Err(_) => result.breaches += 1,
                }
            }
            // Release newest first half the time to exercise out-of-order drops.
            if rng.gen_bool(0.5) {
                held.reverse();
            }
            drop(held);
        }
        result
    }

    let args = parse_args()?;
    let tm = Arc::new(ThreadManager::new(ThreadConfig {
        fail_fast_on_order_violation: false,
        ..ThreadConfig::default()
    }));
    let timeout = Duration::from_millis(args.timeout_ms);

    let started = Instant::now();
    let handles: Vec<_> = (0..args.threads)
        .map(|i| {
            let tm = Arc::clone(&tm);
            let iterations = args.iterations;
            let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(i as u64));
            std::thread::Builder::new()
                .name(format!("lock-stress-{i}"))
                .spawn(move || worker(&tm, &mut rng, iterations, timeout))
                .map_err(|e| e.to_string())
        })
        .collect::<Result<_, _>>()?;

    let mut total = ThreadResult::default();
    for handle in handles {
        let r = handle
            .join()
            .map_err(|_| "stress thread panicked".to_string())?;
        total.acquired += r.acquired;
        total.order_rejections += r.order_rejections;
        total.timeouts += r.timeouts;
        total.breaches += r.breaches;
        total.max_rejection_us = total.max_rejection_us.max(r.max_rejection_us);
    }

    let metrics = tm.metrics().map_err(|e| e.to_string())?;
    let summary = Summary {
        threads: args.threads,
        iterations: args.iterations,
        seed: args.seed,
        elapsed_ms: started.elapsed().as_secs_f64() * 1_000.0,
        acquired: total.acquired,
        order_rejections: total.order_rejections,
        timeouts: total.timeouts,
        breaches: total.breaches,
        max_rejection_us: total.max_rejection_us,
        mean_lock_wait_us: metrics.mean_lock_wait_us,
        max_lock_wait_us: metrics.max_lock_wait_us,
    };

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    match &args.output {
        Some(path) => std::fs::write(path, &json).map_err(|e| e.to_string())?,
        None => println!("{json}"),
    }

    if summary.breaches > 0 {
        return Err(format!("{} lock protocol breaches", summary.breaches));
    }
    Ok(())
}
