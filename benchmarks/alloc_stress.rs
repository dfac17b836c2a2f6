use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Allocation-heavy, memory-bound workload for exercising the preload
/// library: each thread keeps a pool of large buffers, replaces some of
/// them every round and reads the rest at random.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = 8)]
    threads: usize,

    /// Buffers kept alive per thread
    #[arg(short, long, default_value_t = 16)]
    buffers: usize,

    /// Size of each buffer in MiB
    #[arg(short = 'm', long, default_value_t = 8)]
    buffer_mib: usize,

    /// Fraction of buffers replaced every round
    #[arg(short, long, default_value_t = 0.1)]
    churn: f64,

    /// Run time in seconds
    #[arg(short, long, default_value_t = 30)]
    duration: u64,
}

const CACHE_LINE: usize = 64;

fn fresh_buffer(len: usize, seed: u64) -> Vec<u64> {
    let mut buffer = vec![0u64; len];
    // Fault every page in.
    for (i, word) in buffer.iter_mut().enumerate().step_by(512) {
        *word = seed ^ i as u64;
    }
    buffer
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let words = args.buffer_mib * (1 << 20) / 8;
    let deadline = Duration::from_secs(args.duration);

    println!("--- NUMAFLUX ALLOCATION STRESS ---");
    println!("Threads:      {}", args.threads);
    println!("Buffers:      {} x {} MiB per thread", args.buffers, args.buffer_mib);
    println!("Churn:        {:.0}% per round", args.churn * 100.0);
    println!("Duration:     {} s", args.duration);
    println!("----------------------------------\n");

    let barrier = Arc::new(Barrier::new(args.threads));
    let touches = Arc::new(AtomicU64::new(0));
    let replaced = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..args.threads)
        .map(|id| {
            let barrier = barrier.clone();
            let touches = touches.clone();
            let replaced = replaced.clone();
            let (buffers, churn) = (args.buffers, args.churn);

            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(id as u64);
                let mut pool: Vec<Vec<u64>> = (0..buffers).map(|i| fresh_buffer(words, i as u64)).collect();
                barrier.wait();

                let began = Instant::now();
                let mut checksum = 0u64;
                let mut round = 0u64;
                while began.elapsed() < deadline {
                    for slot in pool.iter_mut() {
                        if rng.gen_bool(churn) {
                            *slot = fresh_buffer(words, round);
                            replaced.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    let mut local = 0u64;
                    for _ in 0..100_000 {
                        let buffer = &pool[rng.gen_range(0..pool.len())];
                        let line = rng.gen_range(0..words / (CACHE_LINE / 8));
                        checksum = checksum.wrapping_add(buffer[line * (CACHE_LINE / 8)]);
                        local += 1;
                    }
                    touches.fetch_add(local, Ordering::Relaxed);
                    round += 1;
                }
                debug!("thread {} finished {} rounds", id, round);
                black_box(checksum)
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    let elapsed = start.elapsed();
    let touches = touches.load(Ordering::Relaxed);
    info!("Run complete after {:.2?}", elapsed);

    println!("\n==================================================");
    println!("          NUMAFLUX STRESS RECEIPT                 ");
    println!("==================================================");
    println!(" Wall Clock:   {:.2?}", elapsed);
    println!(" Touches:      {}", touches);
    println!(" Throughput:   {:.2} M touches/sec", touches as f64 / elapsed.as_secs_f64() / 1e6);
    println!(" Replaced:     {} buffers", replaced.load(Ordering::Relaxed));
    println!("==================================================\n");
}
