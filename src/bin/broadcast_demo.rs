use log::info;
use shm_dispatcher::{Dispatcher, Fragment, FragmentResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    env_logger::init();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::Release))
            .expect("Error setting Ctrl-C handler");
    }

    let dispatcher = Arc::new(
        Dispatcher::builder("broadcast-demo")
            .subscriptions(["fast", "slow"])
            .build()
            .expect("Create dispatcher"),
    );

    let published = Arc::new(AtomicU64::new(0));
    let producer = {
        let dispatcher = dispatcher.clone();
        let running = running.clone();
        let published = published.clone();
        std::thread::spawn(move || {
            let mut counter: u64 = 0;
            while running.load(Ordering::Acquire) {
                match dispatcher.offer(&counter.to_le_bytes()) {
                    Ok(_) => {
                        counter += 1;
                        published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) if err.is_retryable() => std::thread::yield_now(),
                    Err(err) => {
                        info!("Producer stopping: {}", err);
                        return;
                    }
                }
            }
        })
    };

    let consumers: Vec<_> = ["fast", "slow"]
        .iter()
        .map(|name| {
            let mut sub = dispatcher.subscription_by_name(name).expect("Subscription exists");
            let running = running.clone();
            let slow = *name == "slow";
            std::thread::spawn(move || {
                let mut expected: u64 = 0;
                let mut handler = |fragment: &Fragment<'_>| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(fragment.payload());
                    assert_eq!(u64::from_le_bytes(bytes), expected);
                    expected += 1;
                    FragmentResult::Consume
                };
                while running.load(Ordering::Acquire) && !sub.is_closed() {
                    if sub.poll(&mut handler, 256) == 0 {
                        std::thread::yield_now();
                    }
                    if slow {
                        std::thread::sleep(Duration::from_micros(50));
                    }
                }
                return expected;
            })
        })
        .collect();

    let start = Instant::now();
    let mut last = 0;
    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_secs(1));
        let now = published.load(Ordering::Relaxed);
        info!(
            "{}: {} msgs/s, {} total after {:?}",
            dispatcher,
            now - last,
            now,
            start.elapsed()
        );
        last = now;
    }

    producer.join().expect("Producer panicked");
    for (name, consumer) in ["fast", "slow"].iter().zip(consumers) {
        let received = consumer.join().expect("Consumer panicked");
        info!("{} received {} messages", name, received);
    }
    dispatcher.close().expect("Close dispatcher");
}
