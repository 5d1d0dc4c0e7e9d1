use log::info;
use shm_dispatcher::{Dispatcher, Fragment, FragmentResult, Mode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    env_logger::init();

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::Release))
            .expect("Error setting Ctrl-C handler");
    }

    let dispatcher = Arc::new(
        Dispatcher::builder("pipeline-demo")
            .mode(Mode::Pipeline)
            .subscriptions(["decode", "validate", "apply"])
            .verify_checksums(true)
            .build()
            .expect("Create dispatcher"),
    );

    let producer = {
        let dispatcher = dispatcher.clone();
        let running = running.clone();
        std::thread::spawn(move || {
            let mut counter: u64 = 0;
            while running.load(Ordering::Acquire) {
                match dispatcher.offer_with_stream(&counter.to_le_bytes(), (counter % 4) as u32) {
                    Ok(_) => counter += 1,
                    Err(err) if err.is_retryable() => std::thread::yield_now(),
                    Err(err) => {
                        info!("Producer stopping: {}", err);
                        break;
                    }
                }
            }
            return counter;
        })
    };

    let stage = |name: &'static str| {
        let mut sub = dispatcher.subscription_by_name(name).expect("Stage exists");
        let running = running.clone();
        return std::thread::spawn(move || {
            let mut seen: u64 = 0;
            let mut failed: u64 = 0;
            let mut handler = |fragment: &Fragment<'_>| {
                seen += 1;
                if fragment.is_failed() {
                    failed += 1;
                }
                // every tenth fragment does not validate
                if name == "validate" && seen % 10 == 0 {
                    return FragmentResult::Failed;
                }
                return FragmentResult::Consume;
            };
            while running.load(Ordering::Acquire) && !sub.is_closed() {
                if sub.poll(&mut handler, 128) == 0 {
                    std::thread::sleep(Duration::from_micros(10));
                }
            }
            return (seen, failed);
        });
    };
    let stages: Vec<_> = ["decode", "validate", "apply"]
        .into_iter()
        .map(|name| (name, stage(name)))
        .collect();

    while running.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_secs(1));
        info!("{} at {:?}", dispatcher, dispatcher.publisher_position());
    }

    let produced = producer.join().expect("Producer panicked");
    info!("Produced {} messages", produced);
    for (name, handle) in stages {
        let (seen, failed) = handle.join().expect("Stage panicked");
        info!("{}: {} fragments, {} failed", name, seen, failed);
    }
    dispatcher.close().expect("Close dispatcher");
}
