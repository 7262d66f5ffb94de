use std::future::Future;
use std::sync::Arc;

use archivist_queue::{Delivery, Subscription};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::backpressure::IntakeGate;

/// Pulls deliveries and runs `handler` on each, at most `concurrency` at a
/// time. With a gate, no delivery is handed out while the gate is paused.
/// Returns once the subscription closes.
pub async fn run_consumer<H, Fut>(
    mut subscription: Subscription,
    mut gate: Option<IntakeGate>,
    concurrency: usize,
    handler: H,
) where
    H: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let handler = Arc::new(handler);
    info!(
        "consumer: {} running with concurrency {}",
        subscription.topic(),
        concurrency.max(1)
    );
    loop {
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let Some(delivery) = subscription.next().await else {
            break;
        };
        if let Some(gate) = gate.as_mut() {
            if gate.is_paused() {
                debug!("consumer: {} waiting for intake to resume", gate.source());
            }
            gate.wait_open().await;
        }
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler(delivery).await;
            drop(permit);
        });
    }
    info!("consumer: {} subscription closed", subscription.topic());
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use archivist_queue::{DelayedQueue, InMemoryBroker};

    use super::run_consumer;
    use crate::backpressure::{BackpressureController, ProbeConfig, ProbeError, ProbeFn};

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_bounds_running_handlers() {
        let broker = InMemoryBroker::new();
        let queue = DelayedQueue::new(Arc::new(broker.clone()));
        for n in 0..6_u32 {
            queue.publish_now("upload", &n).await.expect("publish");
        }
        let sub = queue.subscribe("upload", 16).await.expect("subscribe");

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (r, p, d) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&done));
        tokio::spawn(run_consumer(sub, None, 2, move |delivery| {
            let (running, peak, done) = (Arc::clone(&r), Arc::clone(&p), Arc::clone(&d));
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                delivery.ack().await.expect("ack");
                done.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(broker.unacked_len("upload"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_gate_holds_deliveries_until_resume() {
        let queue = DelayedQueue::new(Arc::new(InMemoryBroker::new()));
        let controller = BackpressureController::new();
        let probe = ProbeFn(|| async { Ok::<bool, ProbeError>(false) });
        controller.pause("upload", ProbeConfig::new(Arc::new(probe), Duration::from_secs(60)));

        queue.publish_now("upload", &1_u32).await.expect("publish");
        let sub = queue.subscribe("upload", 4).await.expect("subscribe");
        let handled = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&handled);
        tokio::spawn(run_consumer(
            sub,
            Some(controller.gate("upload")),
            1,
            move |delivery| {
                let handled = Arc::clone(&h);
                async move {
                    handled.fetch_add(1, Ordering::SeqCst);
                    delivery.ack().await.expect("ack");
                }
            },
        ));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 0);

        controller.resume("upload");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }
}
