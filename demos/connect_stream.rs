use std::error::Error;
use std::io::Write;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use workbench_stream::stream::proto::{format_duration, format_progress};
use workbench_stream::{StreamConfig, StreamEventHandlers, StreamSession};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let inference_id = "REPLACE_WITH_INFERENCE_ID".to_string();
    let user_id = "REPLACE_WITH_USER_ID".to_string();
    let token = "REPLACE_WITH_ACCESS_TOKEN".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();
        let on_complete = done_tx.clone();
        let on_error = done_tx.clone();
        let on_cancelled = done_tx;

        let handlers = StreamEventHandlers::new()
            .on_connection_change(|status| println!("status={status}"))
            .on_progress(|event| {
                println!(
                    "progress={} stage={}",
                    format_progress(event.data.overall_progress),
                    event.data.stage_label().unwrap_or("-"),
                );
            })
            .on_chunk(|event| {
                print!("{}", event.data.text);
                let _ = std::io::stdout().flush();
            })
            .on_complete(move |event| {
                let elapsed = event
                    .data
                    .elapsed_time_seconds
                    .map(format_duration)
                    .unwrap_or_else(|| "-".to_string());
                let _ = on_complete.send(format!("complete elapsed={elapsed}"));
            })
            .on_error(move |event| {
                let _ = on_error.send(format!("error message={}", event.data.message));
            })
            .on_cancelled(move |_| {
                let _ = on_cancelled.send("cancelled".to_string());
            });

        let config = StreamConfig::from_env(inference_id)
            .with_user_id(user_id)
            .with_credential(SecretString::new(token))
            .with_reconnect_interval(Duration::from_secs(2));
        let session = StreamSession::new(config, handlers);
        session.connect();

        if let Some(outcome) = done_rx.recv().await {
            println!();
            println!("{outcome}");
        }
        session.disconnect();

        Ok::<(), Box<dyn Error>>(())
    })
}
