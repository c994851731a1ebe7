use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

type BoxedObserver<A> = Box<dyn Fn(A) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// A registry of async observers that can be fired in order, tolerating
/// observers being added or removed while an iteration is in flight.
///
/// Adding during a running `call` never affects that call (it only sees a
/// snapshot taken at its start). Removing an observer not yet visited by a
/// running call causes it to be skipped rather than invoked.
pub struct FunctionList<A> {
    observers: Mutex<Vec<(u64, BoxedObserver<A>)>>,
    next_id: Mutex<u64>,
}

pub struct ObserverId(u64);

impl<A: Clone + Send + 'static> FunctionList<A> {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    pub fn add<F, Fut>(&self, f: F) -> ObserverId
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            let id = *next_id;
            *next_id += 1;
            id
        };
        let boxed: BoxedObserver<A> = Box::new(move |a| Box::pin(f(a)));
        self.observers.lock().unwrap().push((id, boxed));
        ObserverId(id)
    }

    pub fn remove(&self, id: &ObserverId) {
        self.observers.lock().unwrap().retain(|(i, _)| *i != id.0);
    }

    /// Invoke every observer currently registered, in registration order.
    /// Observers removed after the snapshot is taken but before their turn
    /// are skipped; observers added after the snapshot is taken are not
    /// part of this call.
    pub async fn call(&self, arg: A) {
        let snapshot: Vec<u64> = self
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| *id)
            .collect();

        for id in snapshot {
            let fut = {
                let observers = self.observers.lock().unwrap();
                observers
                    .iter()
                    .find(|(i, _)| *i == id)
                    .map(|(_, f)| f(arg.clone()))
            };
            if let Some(fut) = fut {
                fut.await;
            }
        }
    }
}

impl<A: Clone + Send + 'static> Default for FunctionList<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn fires_all_registered_observers_in_order() {
        let list: FunctionList<u32> = FunctionList::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..3 {
            let seen = seen.clone();
            list.add(move |v| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(v);
                }
            });
        }

        list.call(7).await;
        assert_eq!(*seen.lock().unwrap(), vec![7, 7, 7]);
    }

    #[tokio::test]
    async fn removed_observer_is_skipped() {
        let list: FunctionList<u32> = FunctionList::new();
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let id = list.add(move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        list.remove(&id);

        list.call(1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
