//! Benchmark NOP round trips through the io_uring multiplexer. This is a stress test for the
//! recording, submission and reaping paths.

#[cfg(target_os = "linux")]
mod bench {
    use std::fmt;
    use std::time::{Duration, Instant};

    use iomux::io_uring::{IoUringMultiplexer, IoUringOptions, Sqe};
    use iomux::multiplexer::{Multiplexer, PumpMode, PumpStatistics};
    use iomux::Deadline;

    struct Bench {
        batch: u32,
        num_events: u64,
    }

    const BENCH_RUNS: &[Bench] = &[
        Bench {
            batch: 1,
            num_events: 1_000_000,
        },
        Bench {
            batch: 8,
            num_events: 4_000_000,
        },
        Bench {
            batch: 64,
            num_events: 10_000_000,
        },
        Bench {
            batch: 256,
            num_events: 10_000_000,
        },
    ];

    struct Measurement {
        total_events: u64,
        batch: u32,
        duration: Duration,
        histogram: hdrhistogram::Histogram<u64>,
    }

    impl fmt::Display for Measurement {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                r"completed {} noop events in batches of {}
            duration: {:?}, {:?} per event",
                self.total_events,
                self.batch,
                self.duration,
                self.duration / self.total_events as u32
            )
        }
    }

    fn new_histogram() -> hdrhistogram::Histogram<u64> {
        hdrhistogram::Histogram::<u64>::new_with_bounds(1, 1000 * 1000 * 1000, 3).unwrap()
    }

    fn run_bench(multiplexer: &IoUringMultiplexer, bench: &Bench) -> Measurement {
        let mut histogram = new_histogram();
        let rounds = bench.num_events / bench.batch as u64;
        let start_time = Instant::now();
        for _ in 0..rounds {
            let round_start = Instant::now();
            let mut context = multiplexer.record();
            for _ in 0..bench.batch {
                context.push(Sqe::nop()).unwrap();
            }
            context.commit();

            let mut total = PumpStatistics::default();
            while total.completed < bench.batch as usize {
                total += multiplexer.pump(PumpMode::ALL, Deadline::Never).unwrap();
            }
            histogram
                .record(round_start.elapsed().as_nanos() as u64)
                .unwrap();
        }
        Measurement {
            total_events: rounds * bench.batch as u64,
            batch: bench.batch,
            duration: start_time.elapsed(),
            histogram,
        }
    }

    pub fn main() {
        if !iomux::io_uring::is_supported() {
            println!("io_uring is not supported by this kernel");
            return;
        }
        for bench in BENCH_RUNS {
            let options = IoUringOptions {
                submission_queue_size: bench.batch,
                ..IoUringOptions::default()
            };
            let multiplexer = IoUringMultiplexer::new(&options).unwrap();
            let measurement = run_bench(&multiplexer, bench);

            println!("{}", measurement);
            println!(
                "50'th round trip percentile: {}ns",
                measurement.histogram.value_at_quantile(0.50)
            );
            println!(
                "99'th round trip percentile: {}ns",
                measurement.histogram.value_at_quantile(0.99)
            );
            println!(
                "99.9'th round trip percentile: {}ns\n",
                measurement.histogram.value_at_quantile(0.999)
            );
        }
    }
}

fn main() {
    #[cfg(target_os = "linux")]
    bench::main();
}
