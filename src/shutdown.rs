//! Root cancellation signal shared by every control loop.

use tokio::sync::watch;

/// Sending half, held by main. Firing it once stops every loop.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown { rx: self.tx.subscribe() }
    }
}

/// Receiving half, cloned into each loop. `recv` resolves once the
/// root signal fires and stays resolved after.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn recv(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // The sender lives in main for the process lifetime; a closed
        // channel also means it is time to stop.
        while self.rx.changed().await.is_ok() {
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

pub fn channel() -> (ShutdownHandle, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, Shutdown { rx })
}
