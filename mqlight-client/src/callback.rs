use crate::error::ClientError;
use crate::model::ClientState;
use anyhow::Result;
use log::{debug, error};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

/// User supplied function notified about every state transition.
pub type Observer = Box<dyn Fn(ClientState, Option<&ClientError>) + Send + 'static>;

/// A state transition waiting to be delivered to the observer.
#[derive(Debug)]
pub(crate) struct Notification {
    pub(crate) state: ClientState,
    pub(crate) cause: Option<ClientError>,
}

pub(crate) type NotificationSink = mpsc::Sender<Notification>;

/// Start the thread which delivers the notifications one by one. The thread exits when every
/// sender is dropped.
pub(crate) fn start(client_id: &str, observer: Observer) -> Result<NotificationSink> {
    let (tx, rx) = mpsc::channel::<Notification>();
    let name = format!("mqlight-callback-{}", client_id);

    thread::Builder::new().name(name).spawn(move || {
        for notification in rx {
            debug!("Notify observer {:?}", notification);

            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                observer(notification.state, notification.cause.as_ref())
            }));

            if let Err(e) = result {
                let reason = e
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| e.downcast_ref::<String>().cloned())
                    .unwrap_or_default();

                error!("Observer panicked on {} notification {}", notification.state, reason);
            }
        }

        debug!("Callback thread exits");
    })?;

    Ok(tx)
}
