//! Streaming demo: submit a handful of prompts and poll their output the way
//! an HTTP consumer would, until every request reaches a terminal status.

use std::sync::Arc;
use std::time::Duration;

use streambatch::batch::JobManager;
use streambatch::config::BatchingConfig;
use streambatch::generator::TextGenerator;
use streambatch::sink::{MemorySink, ResultSink};
use streambatch::telemetry::init_tracing;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");
    println!("🚀 streambatch - Streaming Demo\n");

    let config = BatchingConfig::from_env()?;
    println!(
        "Batch window {:?}, up to {} requests per batch, {} batches at once\n",
        config.batch_window, config.max_requests_per_batch, config.max_concurrent_batches
    );

    let sink = Arc::new(MemorySink::new());
    let generator = TextGenerator::new()
        .with_char_delay(Duration::from_millis(2))
        .with_word_pause(Duration::from_millis(20), 0.3);
    let manager = JobManager::new(config, Arc::new(generator), sink.clone())?;
    let run_loop = manager.spawn_run_loop();
    let mut outcomes = manager.subscribe();

    let prompts = [
        "Explain request batching",
        "Why bound the batch window",
        "Describe admission control",
        "What is cooperative cancellation",
        "Summarise streaming output",
        "List the terminal statuses",
    ];

    let mut ids = Vec::new();
    for prompt in prompts {
        let id = manager.submit_prompt(prompt).await?;
        println!("Submitted {id}: {prompt}");
        ids.push(id);
    }
    println!();

    // Poll every request until it is terminal.
    let mut last_len = vec![0usize; ids.len()];
    loop {
        let mut done = 0;
        for (index, id) in ids.iter().enumerate() {
            let status = sink.get_status(*id).await?;
            let content = sink.get_content(*id).await?.unwrap_or_default();
            if content.len() != last_len[index] {
                println!("[{index}] {status} ({} chars)", content.chars().count());
                last_len[index] = content.len();
            }
            if status.is_terminal() {
                done += 1;
            }
        }
        if done == ids.len() {
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    println!("\nFinal responses:");
    for id in &ids {
        let content = sink.get_content(*id).await?.unwrap_or_default();
        println!("--- {id}\n{content}\n");
    }

    manager.shutdown().await?;
    run_loop.await??;

    while let Ok(outcome) = outcomes.try_recv() {
        println!(
            "Batch {} ({}): {} of {} succeeded in {:?}",
            outcome.batch_id,
            outcome.trigger.as_str(),
            outcome.metrics.successful_requests,
            outcome.metrics.total_requests,
            outcome.duration()
        );
    }

    let stats = manager.stats();
    println!(
        "\n✅ {} requests in {} batches, peak {} batches running at once",
        stats.requests_accepted, stats.batches_finished, stats.peak_active_batches
    );

    Ok(())
}
