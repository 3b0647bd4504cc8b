//! Event handler registry and the incoming-message processor.
//!
//! Registration is typed: `on` binds an async callback taking
//! `(Arc<Channel>, T)` for a JSON-decodable `T`, `on_with_result`
//! additionally returns a serializable value consumed by ack handling. The
//! registry lock is held only across map operations, never across a user
//! callback.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::channel::Channel;
use crate::error::Error;
use crate::protocol::{self, Message, MessageType};
use crate::transport::BoxFuture;

/// Event raised when a session becomes visible to handlers.
pub const ON_CONNECTION: &str = "connection";
/// Event raised exactly once when a session closes.
pub const ON_DISCONNECTION: &str = "disconnection";

/// Arguments handed to a caller: `None` for system events (the callback
/// receives the zero value), `Some` raw JSON text otherwise.
type RawArgs = Option<String>;

type BoxedCaller =
    Box<dyn Fn(Arc<Channel>, RawArgs) -> BoxFuture<'static, Result<Option<String>, Error>> + Send + Sync>;

/// A registered callback together with what its signature declared.
pub(crate) struct Caller {
    func: BoxedCaller,
    returns_value: bool,
}

impl Caller {
    pub(crate) fn returns_value(&self) -> bool {
        self.returns_value
    }

    pub(crate) async fn invoke(
        &self,
        channel: Arc<Channel>,
        args: RawArgs,
    ) -> Result<Option<String>, Error> {
        (self.func)(channel, args).await
    }
}

/// Hook run for a system event before any user handler of the same name.
pub(crate) type SystemHook = Arc<dyn Fn(&Arc<Channel>) + Send + Sync>;

/// Map from event name to caller, shared by a server or client and all of
/// its channels.
#[derive(Default)]
pub(crate) struct Handlers {
    callers: RwLock<HashMap<String, Arc<Caller>>>,
    on_connection: RwLock<Option<SystemHook>>,
    on_disconnection: RwLock<Option<SystemHook>>,
}

/// Decode the raw args into the declared parameter type. Callbacks that
/// declare `()` ignore the payload and always receive the zero value.
fn decode_arg<T>(args: RawArgs) -> Result<T, Error>
where
    T: DeserializeOwned + Default + 'static,
{
    if TypeId::of::<T>() == TypeId::of::<()>() {
        return Ok(T::default());
    }
    match args {
        Some(json) => serde_json::from_str(&json).map_err(Error::Json),
        None => Ok(T::default()),
    }
}

impl Handlers {
    /// Bind a callback to an event name, replacing any previous binding.
    pub(crate) fn on<T, F, Fut>(&self, event: &str, f: F)
    where
        T: DeserializeOwned + Default + Send + 'static,
        F: Fn(Arc<Channel>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let func: BoxedCaller = Box::new(move |channel, args| match decode_arg::<T>(args) {
            Ok(arg) => {
                let fut = f(channel, arg);
                Box::pin(async move {
                    fut.await;
                    Ok(None)
                })
            }
            Err(err) => Box::pin(async move { Err(err) }),
        });
        let caller = Caller {
            returns_value: false,
            func,
        };
        self.callers.write().insert(event.to_owned(), Arc::new(caller));
    }

    /// Bind a callback whose return value answers ack requests.
    pub(crate) fn on_with_result<T, R, F, Fut>(&self, event: &str, f: F)
    where
        T: DeserializeOwned + Default + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<Channel>, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let func: BoxedCaller = Box::new(move |channel, args| match decode_arg::<T>(args) {
            Ok(arg) => {
                let fut = f(channel, arg);
                Box::pin(async move {
                    let out = fut.await;
                    let json = serde_json::to_string(&out).map_err(Error::Json)?;
                    Ok(Some(json))
                })
            }
            Err(err) => Box::pin(async move { Err(err) }),
        });
        let caller = Caller {
            returns_value: true,
            func,
        };
        self.callers.write().insert(event.to_owned(), Arc::new(caller));
    }

    pub(crate) fn find(&self, event: &str) -> Option<Arc<Caller>> {
        self.callers.read().get(event).cloned()
    }

    pub(crate) fn set_on_connection(&self, hook: SystemHook) {
        *self.on_connection.write() = Some(hook);
    }

    pub(crate) fn set_on_disconnection(&self, hook: SystemHook) {
        *self.on_disconnection.write() = Some(hook);
    }

    /// Raise a system event: the system slot first, then any user handler
    /// registered under the same name (invoked with the zero value).
    pub(crate) async fn call_loop_event(&self, channel: &Arc<Channel>, event: &str) {
        let hook = match event {
            ON_CONNECTION => self.on_connection.read().clone(),
            ON_DISCONNECTION => self.on_disconnection.read().clone(),
            _ => None,
        };
        if let Some(hook) = hook {
            hook(channel);
        }

        let Some(caller) = self.find(event) else {
            channel.error(Error::MissingHandler(event.to_owned()));
            return;
        };
        if let Err(err) = caller.invoke(channel.clone(), None).await {
            channel.error(err);
        }
    }

    /// Process one non-control inbound message on a channel.
    pub(crate) async fn process_incoming(&self, channel: &Arc<Channel>, msg: Message) {
        match msg.message_type {
            MessageType::Emit => {
                let Some(caller) = self.find(&msg.method) else {
                    channel.error(Error::MissingHandler(msg.method));
                    return;
                };
                if let Err(err) = caller.invoke(channel.clone(), Some(msg.args)).await {
                    channel.error(err);
                }
            }
            MessageType::AckRequest => {
                let Some(ack_id) = msg.ack_id else { return };
                let caller = match self.find(&msg.method) {
                    Some(caller) if caller.returns_value() => caller,
                    _ => {
                        channel.error(Error::MissingHandler(msg.method));
                        return;
                    }
                };
                match caller.invoke(channel.clone(), Some(msg.args)).await {
                    Ok(result) => {
                        let response = Message::ack_response(
                            ack_id,
                            result.unwrap_or_else(|| "null".to_owned()),
                        );
                        match protocol::encode(&response) {
                            Ok(frame) => channel.send_out(frame).await,
                            Err(err) => channel.error(err),
                        }
                    }
                    Err(err) => channel.error(err),
                }
            }
            MessageType::AckResponse => {
                let Some(ack_id) = msg.ack_id else { return };
                match channel.ack_table().take(ack_id) {
                    // The receiving half is gone if the wait already
                    // resolved; the payload is dropped silently then.
                    Some(waiter) => {
                        let _ = waiter.send(msg.args);
                    }
                    None => channel.error(Error::MissingAckWaiter(ack_id)),
                }
            }
            _ => {}
        }
    }
}
