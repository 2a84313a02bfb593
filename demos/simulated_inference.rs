//! Demonstration of the EMG Intent Agent pipeline without hardware.
//!
//! This example shows how to:
//! 1. Connect to the synthetic signal source
//! 2. Accumulate one-second windows
//! 3. Separate each window with FastICA
//! 4. Classify and aggregate votes into decisions
//! 5. Observe dispatched decisions on a subscriber
//!
//! Run with: cargo run --example simulated_inference

use std::time::Duration;

use emg_intent_agent::{
    config::{DispatchConfig, IntentLabels},
    core::{
        FastIcaSeparator, InferencePipeline, Outcome, SharedDecision, SimulatedClassifier,
        WindowAccumulator,
    },
    dispatch::Dispatcher,
    serial::{ChannelMode, SignalSource, SimulatedSource},
    stats::create_shared_stats,
    SAFETY_NOTICE,
};
use tokio_util::sync::CancellationToken;

fn main() {
    println!("EMG Intent Agent - Simulated Inference Demo");
    println!("===========================================");
    println!();
    println!("{SAFETY_NOTICE}");
    println!();

    let sample_rate = 250;
    let source = SimulatedSource::new(ChannelMode::Single, sample_rate).real_time();
    println!("Source: {}", source.describe());

    let mut lines = match source.connect() {
        Ok(lines) => lines,
        Err(e) => {
            eprintln!("Error connecting: {e}");
            return;
        }
    };

    let dispatcher = Dispatcher::new(&DispatchConfig::default(), SharedDecision::new());
    let mut decisions = dispatcher.subscribe();
    let stats = create_shared_stats();

    let mut pipeline = InferencePipeline::new(
        Box::new(FastIcaSeparator::default()),
        Box::new(SimulatedClassifier::new(IntentLabels::default(), 0.6, None)),
        Duration::from_secs(1),
        IntentLabels::default(),
        dispatcher.clone(),
        stats.clone(),
    );

    let cancel = CancellationToken::new();
    let c = cancel.clone();

    // Set up Ctrl+C handler
    ctrlc::set_handler(move || c.cancel())
    .expect("Error setting Ctrl+C handler");

    // Stop after 20 seconds
    let timer = cancel.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(20));
        timer.cancel();
    });

    println!("Running for 20 seconds (Ctrl+C to stop early)...");
    println!();

    let accumulator =
        WindowAccumulator::inference(ChannelMode::Single, sample_rate, Duration::from_secs(1));
    let result = pipeline.run(&mut *lines, accumulator, &cancel, |report| {
        let verdict = match report.outcome {
            Outcome::Accepted(_) => "accepted",
            Outcome::CooldownActive => "cooldown",
            Outcome::HeldByHysteresis => "held",
        };
        println!(
            "Window: {} samples, {} yes / {} no -> {:?} ({verdict})",
            report.samples, report.tally.affirmative, report.tally.negative, report.vote
        );
    });

    if let Err(e) = result {
        eprintln!("Session ended with error: {e}");
    }

    println!();
    println!("Dispatched decisions:");
    while let Ok(event) = decisions.try_recv() {
        println!("  {} ({:?})", event.command, event.intent);
    }

    println!();
    println!("{}", stats.summary());
}
