use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// One-shot exit signal observed by every loop of a server or client run.
#[derive(Default)]
pub(crate) struct Shutdown {
    exit: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.exit.store(true, SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.exit.load(SeqCst)
    }

    /// Resolves once `trigger` has been called, including before this call.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Waits up to `grace` for the loops to observe the signal, then aborts
/// whatever is still running.
pub(crate) async fn join_tasks(mut tasks: Vec<JoinHandle<()>>, grace: Duration) {
    let joined = timeout(grace, async {
        for t in tasks.iter_mut() {
            let _ = t.await;
        }
    })
    .await;

    if joined.is_err() {
        log::warn!("tasks did not stop within {:?}, aborting", grace);
        for t in tasks.iter() {
            t.abort();
        }
    }
}
