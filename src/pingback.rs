//! Fire-and-forget event reporter. Never on the data path: events are
//! queued onto an unbounded channel and a background task drives the
//! HTTP client; failures are logged and dropped.

use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Debug)]
struct Event {
    name: &'static str,
    params: Vec<(String, String)>,
}

/// Cheap clonable handle. With no URL configured every send is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Pingback {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl Pingback {
    pub fn disabled() -> Pingback {
        Pingback::default()
    }

    /// Spawn the reporter task on the current runtime.
    pub fn spawn(url: Option<String>) -> Pingback {
        let Some(url) = url else {
            return Pingback::disabled();
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            while let Some(event) = rx.recv().await {
                let mut query = vec![("event".to_string(), event.name.to_string())];
                query.extend(event.params);
                match client.get(&url).query(&query).send().await {
                    Ok(response) => {
                        debug!(message = "pingback delivered", event = event.name,
                               status = response.status().as_u16());
                    }
                    Err(error) => {
                        error!(message = "pingback failed", event = event.name, %error);
                    }
                }
            }
        });
        Pingback { tx: Some(tx) }
    }

    pub fn send(&self, name: &'static str, params: &[(&str, String)]) {
        if let Some(tx) = &self.tx {
            let event = Event {
                name,
                params: params
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            };
            let _ = tx.send(event);
        }
    }
}
