use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::Result;

/// Run `cycle` every `interval` until `stop` flips to `true`.
///
/// Cycles never overlap. A stop request lets the running cycle finish; a
/// cycle exceeding `budget` is abandoned and the loop carries on. A cycle
/// returning an error ends the loop with that error. Returns the number of
/// completed cycles.
pub async fn run_periodic<F, Fut>(
    name: &str,
    interval: Duration,
    budget: Duration,
    mut stop: watch::Receiver<bool>,
    mut cycle: F,
) -> Result<u64>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut completed = 0;
    info!("{} loop started, interval {:?}", name, interval);

    loop {
        if *stop.borrow() {
            break;
        }

        match tokio::time::timeout(budget, cycle()).await {
            Ok(Ok(())) => completed += 1,
            Ok(Err(e)) => {
                error!("{} loop stopping after {} cycle(s): {}", name, completed, e);
                return Err(e);
            }
            Err(_) => warn!("{} cycle exceeded its {:?} budget and was cancelled", name, budget),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }

    info!("{} loop stopped after {} cycle(s)", name, completed);
    Ok(completed)
}
