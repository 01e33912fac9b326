//! Call recording with race-free interceptors.
//!
//! A [`CallRegistry`] holds the calls received for one method key. A test
//! waits for a call by registering an interceptor: a predicate plus a
//! oneshot waiter. Recording and registering take the same lock, so it does
//! not matter whether the call arrives before or after the test starts
//! waiting; the waiter is signalled exactly once either way.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::codec::ParameterCodec;
use crate::error::{Result, RpcError};

/// One received call with its raw parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Method key of the call.
    pub method_key: i32,
    /// Parameter bytes, without length prefixes.
    pub parameters: Vec<Bytes>,
}

impl RecordedCall {
    /// Raw bytes of parameter `index`.
    pub fn parameter(&self, index: usize) -> Option<&[u8]> {
        self.parameters.get(index).map(Bytes::as_ref)
    }

    /// Decode parameter `index` with codec `C`.
    pub fn decode<C: ParameterCodec, T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let parameter = self
            .parameter(index)
            .ok_or(RpcError::InvalidState("call has no parameter at this index"))?;
        C::decode(parameter)
    }
}

impl fmt::Display for RecordedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.method_key)?;
        for (i, parameter) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}B", parameter.len())?;
        }
        f.write_str(")")
    }
}

type Predicate = Box<dyn Fn(&RecordedCall) -> bool + Send>;

struct Interceptor {
    predicate: Predicate,
    waiter: oneshot::Sender<RecordedCall>,
}

#[derive(Default)]
struct Calls {
    log: Vec<RecordedCall>,
    unconsumed: VecDeque<RecordedCall>,
    interceptors: VecDeque<Interceptor>,
}

/// Received calls and pending interceptors of one method key.
pub struct CallRegistry {
    method_key: i32,
    calls: Mutex<Calls>,
}

impl CallRegistry {
    /// Create an empty registry for `method_key`.
    pub fn new(method_key: i32) -> Self {
        Self {
            method_key,
            calls: Mutex::new(Calls::default()),
        }
    }

    /// The method key this registry records.
    pub fn method_key(&self) -> i32 {
        self.method_key
    }

    /// Append `call` to the log and hand it to the first matching interceptor.
    ///
    /// Interceptors whose waiter is gone are skipped and dropped. A call no
    /// interceptor takes is kept for later registrations.
    pub fn record_call(&self, call: RecordedCall) {
        debug_assert_eq!(call.method_key, self.method_key);
        let mut calls = self.lock();
        calls.log.push(call.clone());

        let mut call = call;
        loop {
            let index = calls
                .interceptors
                .iter()
                .position(|i| !i.waiter.is_closed() && (i.predicate)(&call));
            let Some(interceptor) = index.and_then(|index| calls.interceptors.remove(index)) else {
                break;
            };
            match interceptor.waiter.send(call) {
                Ok(()) => {
                    calls.interceptors.retain(|i| !i.waiter.is_closed());
                    return;
                }
                // The waiter gave up between the check and the send
                Err(returned) => call = returned,
            }
        }

        calls.interceptors.retain(|i| !i.waiter.is_closed());
        calls.unconsumed.push_back(call);
    }

    /// Signal `waiter` with the first call matching `predicate`.
    ///
    /// An already recorded, unconsumed match is handed over immediately.
    /// Otherwise the interceptor waits for a future
    /// [`record_call`](Self::record_call).
    pub fn register_interceptor<P>(&self, predicate: P, waiter: oneshot::Sender<RecordedCall>)
    where
        P: Fn(&RecordedCall) -> bool + Send + 'static,
    {
        let mut calls = self.lock();
        if let Some(index) = calls.unconsumed.iter().position(&predicate) {
            if let Some(call) = calls.unconsumed.remove(index) {
                if let Err(call) = waiter.send(call) {
                    calls.unconsumed.insert(index, call);
                }
                return;
            }
        }

        calls.interceptors.push_back(Interceptor {
            predicate: Box::new(predicate),
            waiter,
        });
    }

    /// Register an interceptor and return its receiving end.
    pub fn intercept<P>(&self, predicate: P) -> oneshot::Receiver<RecordedCall>
    where
        P: Fn(&RecordedCall) -> bool + Send + 'static,
    {
        let (waiter, rx) = oneshot::channel();
        self.register_interceptor(predicate, waiter);
        rx
    }

    /// Every recorded call, in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().log.clone()
    }

    /// Number of recorded calls no interceptor took yet.
    pub fn unconsumed(&self) -> usize {
        self.lock().unconsumed.len()
    }

    /// Number of interceptors still waiting.
    pub fn pending_interceptors(&self) -> usize {
        self.lock()
            .interceptors
            .iter()
            .filter(|i| !i.waiter.is_closed())
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let calls = self.lock();
        f.debug_struct("CallRegistry")
            .field("method_key", &self.method_key)
            .field("recorded", &calls.log.len())
            .field("unconsumed", &calls.unconsumed.len())
            .field("interceptors", &calls.interceptors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;

    fn call(n: u8) -> RecordedCall {
        RecordedCall {
            method_key: 5,
            parameters: vec![Bytes::from(vec![n])],
        }
    }

    fn first_byte_is(n: u8) -> impl Fn(&RecordedCall) -> bool + Send + 'static {
        move |call| call.parameter(0) == Some(&[n][..])
    }

    #[test]
    fn test_call_before_interceptor() {
        let registry = CallRegistry::new(5);
        registry.record_call(call(1));
        assert_eq!(registry.unconsumed(), 1);

        let mut rx = registry.intercept(first_byte_is(1));
        assert_eq!(rx.try_recv().unwrap(), call(1));
        assert_eq!(registry.unconsumed(), 0);
        assert_eq!(registry.pending_interceptors(), 0);
    }

    #[test]
    fn test_interceptor_before_call() {
        let registry = CallRegistry::new(5);
        let mut rx = registry.intercept(first_byte_is(2));
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.pending_interceptors(), 1);

        registry.record_call(call(1));
        registry.record_call(call(2));

        assert_eq!(rx.try_recv().unwrap(), call(2));
        assert_eq!(registry.unconsumed(), 1);
        assert_eq!(registry.calls(), vec![call(1), call(2)]);
    }

    #[test]
    fn test_interceptor_signals_once() {
        let registry = CallRegistry::new(5);
        let mut rx = registry.intercept(|_: &RecordedCall| true);
        registry.record_call(call(1));
        registry.record_call(call(1));

        assert_eq!(rx.try_recv().unwrap(), call(1));
        // The second call stays available for the next interceptor
        assert_eq!(registry.unconsumed(), 1);
    }

    #[test]
    fn test_first_matching_interceptor_wins() {
        let registry = CallRegistry::new(5);
        let mut first = registry.intercept(|_: &RecordedCall| true);
        let mut second = registry.intercept(|_: &RecordedCall| true);

        registry.record_call(call(3));
        assert_eq!(first.try_recv().unwrap(), call(3));
        assert!(second.try_recv().is_err());
        assert_eq!(registry.pending_interceptors(), 1);
    }

    #[test]
    fn test_abandoned_interceptor_is_skipped() {
        let registry = CallRegistry::new(5);
        let abandoned = registry.intercept(|_: &RecordedCall| true);
        drop(abandoned);
        let mut live = registry.intercept(|_: &RecordedCall| true);

        registry.record_call(call(4));
        assert_eq!(live.try_recv().unwrap(), call(4));
        assert_eq!(registry.pending_interceptors(), 0);
    }

    #[test]
    fn test_dropped_waiter_keeps_call() {
        let registry = CallRegistry::new(5);
        registry.record_call(call(6));

        let (waiter, rx) = oneshot::channel();
        drop(rx);
        registry.register_interceptor(|_: &RecordedCall| true, waiter);
        assert_eq!(registry.unconsumed(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_record_and_register() {
        let registry = std::sync::Arc::new(CallRegistry::new(5));
        let mut waiters = Vec::new();
        let mut recorders = Vec::new();
        for n in 0..32u8 {
            let registry = registry.clone();
            recorders.push(tokio::spawn(async move { registry.record_call(call(n)) }));
        }
        for n in 0..32u8 {
            waiters.push(registry.intercept(first_byte_is(n)));
        }
        for recorder in recorders {
            recorder.await.unwrap();
        }
        for (n, waiter) in waiters.into_iter().enumerate() {
            assert_eq!(waiter.await.unwrap(), call(n as u8));
        }
        assert_eq!(registry.unconsumed(), 0);
    }

    #[test]
    fn test_decode_parameter() {
        let recorded = RecordedCall {
            method_key: 1,
            parameters: vec![MsgPackCodec::to_vec(&"hi").unwrap().into()],
        };
        let text: String = recorded.decode::<MsgPackCodec, _>(0).unwrap();
        assert_eq!(text, "hi");
        assert!(recorded.decode::<MsgPackCodec, String>(1).is_err());
        assert_eq!(recorded.to_string(), "1(3B)");
    }
}
