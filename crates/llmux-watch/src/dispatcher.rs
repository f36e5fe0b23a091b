use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use llmux_auth::AuthUpdate;

struct Pending {
    map: HashMap<String, AuthUpdate>,
    /// First-insertion order of the keys in `map`.
    order: Vec<String>,
    queue: Option<mpsc::Sender<AuthUpdate>>,
    /// Bumped on every queue swap so a superseded drain task stops.
    epoch: u64,
}

/// Collects auth updates into a pending set and drains whole batches onto
/// the outbound queue.
///
/// Updates are keyed by auth id (or `action:ts` when the update carries no
/// id): within one batch the latest update per key wins while the key keeps
/// its original position. One task waits on the condition, drains everything
/// pending, and pushes it out in order.
pub struct Dispatcher {
    pending: Mutex<Pending>,
    notify: Notify,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Pending {
                map: HashMap::new(),
                order: Vec::new(),
                queue: None,
                epoch: 0,
            }),
            notify: Notify::new(),
        })
    }

    fn key_for(update: &AuthUpdate) -> String {
        if update.id.is_empty() {
            format!(
                "{:?}:{}",
                update.action,
                time::OffsetDateTime::now_utc().unix_timestamp_nanos()
            )
        } else {
            update.id.clone()
        }
    }

    /// Queue one update. Runtime-sourced updates (e.g. from the websocket
    /// relay) come through here as well.
    pub fn enqueue(&self, update: AuthUpdate) {
        let key = Self::key_for(&update);
        {
            let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
            if pending.map.insert(key.clone(), update).is_none() {
                pending.order.push(key);
            }
        }
        self.notify.notify_one();
    }

    /// Swap the outbound queue. `None` cancels dispatching; a new sender
    /// restarts the drain task cleanly.
    pub fn set_queue(self: &Arc<Self>, queue: Option<mpsc::Sender<AuthUpdate>>) {
        let epoch = {
            let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
            pending.epoch += 1;
            pending.queue = queue.clone();
            pending.epoch
        };
        if queue.is_some() {
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move { dispatcher.drain_loop(epoch).await });
        }
    }

    async fn drain_loop(&self, epoch: u64) {
        loop {
            let notified = self.notify.notified();
            let batch = {
                let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
                if pending.epoch != epoch || pending.queue.is_none() {
                    return;
                }
                if pending.order.is_empty() {
                    None
                } else {
                    let order = std::mem::take(&mut pending.order);
                    let mut map = std::mem::take(&mut pending.map);
                    let queue = pending.queue.clone();
                    Some((
                        order
                            .into_iter()
                            .filter_map(|key| map.remove(&key))
                            .collect::<Vec<_>>(),
                        queue,
                    ))
                }
            };

            match batch {
                Some((updates, Some(queue))) => {
                    for update in updates {
                        if queue.send(update).await.is_err() {
                            // Receiver dropped; stop until the queue is swapped.
                            return;
                        }
                    }
                }
                Some((_, None)) => return,
                None => notified.await,
            }
        }
    }
}
