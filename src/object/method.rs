//! Method tables: name to handler maps for [`Hosted`](super::Hosted) objects.
//!
//! Typed handlers get their positional arguments deserialized into any serde
//! type (use a tuple for several arguments) and return any serializable
//! value. Raw handlers see the whole [`Call`], keyword arguments included.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Call, MethodError, ObjectContext};
use crate::Value;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of one method invocation.
pub type MethodResult = Result<Value, MethodError>;

type Hook<T> = Box<dyn Fn(Arc<T>, ObjectContext) -> BoxFuture<'static, Result<(), MethodError>> + Send + Sync>;

/// One callable method of `T`.
pub trait Method<T>: Send + Sync + 'static {
    fn call(&self, target: Arc<T>, call: Call, ctx: ObjectContext) -> BoxFuture<'static, MethodResult>;
}

/// Wrapper that deserializes positional arguments before calling the handler.
pub struct TypedMethod<F, T, A, R, Fut> {
    name: String,
    handler: F,
    _phantom: PhantomData<fn(Arc<T>, A) -> (R, Fut)>,
}

impl<F, T, A, R, Fut> TypedMethod<F, T, A, R, Fut>
where
    F: Fn(Arc<T>, A, ObjectContext) -> Fut + Send + Sync + 'static,
    T: Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
{
    pub fn new(name: &str, handler: F) -> Self {
        Self {
            name: name.to_string(),
            handler,
            _phantom: PhantomData,
        }
    }
}

/// No arguments deserialize from null, so `()` works for nullary methods.
fn parse_args<A: DeserializeOwned>(name: &str, args: Vec<Value>) -> Result<A, MethodError> {
    let packed = if args.is_empty() {
        Value::Null
    } else {
        Value::List(args)
    };
    packed
        .deserialize_into()
        .map_err(|e| MethodError::new("TypeError", format!("invalid arguments for {name}: {e}")))
}

impl<F, T, A, R, Fut> Method<T> for TypedMethod<F, T, A, R, Fut>
where
    F: Fn(Arc<T>, A, ObjectContext) -> Fut + Send + Sync + 'static,
    T: Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
{
    fn call(&self, target: Arc<T>, call: Call, ctx: ObjectContext) -> BoxFuture<'static, MethodResult> {
        let parsed: A = match parse_args(&self.name, call.args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(target, parsed, ctx);
        Box::pin(async move {
            let result = fut.await?;
            Ok(Value::from_serialize(&result)?)
        })
    }
}

struct RawMethod<F>(F);

impl<F, T, Fut> Method<T> for RawMethod<F>
where
    F: Fn(Arc<T>, Call, ObjectContext) -> Fut + Send + Sync + 'static,
    T: Send + Sync + 'static,
    Fut: Future<Output = MethodResult> + Send + 'static,
{
    fn call(&self, target: Arc<T>, call: Call, ctx: ObjectContext) -> BoxFuture<'static, MethodResult> {
        Box::pin((self.0)(target, call, ctx))
    }
}

/// Per-object monitor shared by the object's locked methods.
#[derive(Clone, Default)]
pub struct MethodLock(Arc<Mutex<()>>);

impl MethodLock {
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        self.0.clone().lock_owned().await
    }

    pub fn is_held(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

struct Locked<T> {
    inner: Box<dyn Method<T>>,
    lock: MethodLock,
}

impl<T: Send + Sync + 'static> Method<T> for Locked<T> {
    fn call(&self, target: Arc<T>, call: Call, ctx: ObjectContext) -> BoxFuture<'static, MethodResult> {
        let lock = self.lock.clone();
        let fut = self.inner.call(target, call, ctx);
        Box::pin(async move {
            let _guard = lock.acquire().await;
            fut.await
        })
    }
}

/// Methods and lifecycle hooks of a hosted `T`.
pub struct MethodTable<T> {
    methods: HashMap<String, Box<dyn Method<T>>>,
    lock: MethodLock,
    pub(super) on_start: Option<Hook<T>>,
    pub(super) on_stop: Option<Hook<T>>,
    pub(super) main: Option<Hook<T>>,
}

impl<T: Send + Sync + 'static> MethodTable<T> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            lock: MethodLock::default(),
            on_start: None,
            on_stop: None,
            main: None,
        }
    }

    /// Register a typed method.
    pub fn method<F, A, R, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<T>, A, ObjectContext) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
    {
        self.methods
            .insert(name.to_string(), Box::new(TypedMethod::new(name, handler)));
        self
    }

    /// Register a typed method that holds the object's [`MethodLock`] while it runs.
    pub fn locked<F, A, R, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<T>, A, ObjectContext) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
    {
        let locked = Locked {
            inner: Box::new(TypedMethod::new(name, handler)),
            lock: self.lock.clone(),
        };
        self.methods.insert(name.to_string(), Box::new(locked));
        self
    }

    /// Register a method that receives the whole call.
    pub fn raw<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<T>, Call, ObjectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        self.methods.insert(name.to_string(), Box::new(RawMethod(handler)));
        self
    }

    pub fn on_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<T>, ObjectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MethodError>> + Send + 'static,
    {
        self.on_start = Some(Box::new(move |target, ctx| Box::pin(hook(target, ctx))));
        self
    }

    pub fn on_stop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<T>, ObjectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MethodError>> + Send + 'static,
    {
        self.on_stop = Some(Box::new(move |target, ctx| Box::pin(hook(target, ctx))));
        self
    }

    /// Loop run after start until the object is stopped.
    pub fn main<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Arc<T>, ObjectContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MethodError>> + Send + 'static,
    {
        self.main = Some(Box::new(move |target, ctx| Box::pin(hook(target, ctx))));
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn Method<T>> {
        self.methods.get(name).map(|m| m.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    /// The monitor shared by this table's locked methods.
    pub fn lock(&self) -> &MethodLock {
        &self.lock
    }
}

impl<T: Send + Sync + 'static> Default for MethodTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Hosted, InvokeError, RemoteObject};
    use crate::{args, Location};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Camera {
        exposing: AtomicUsize,
        overlapped: AtomicUsize,
    }

    fn camera() -> Hosted<Camera> {
        Hosted::new(
            Camera::default(),
            MethodTable::new()
                .method("add", |_cam: Arc<Camera>, (a, b): (i64, i64), _ctx| async move { Ok(a + b) })
                .method("ready", |_cam: Arc<Camera>, (): (), _ctx| async move { Ok(true) })
                .method("fail", |_cam: Arc<Camera>, (): (), _ctx| async move {
                    Err::<(), _>(MethodError::new("IOError", "shutter stuck"))
                })
                .locked("expose", |cam: Arc<Camera>, (ms,): (u64,), _ctx| async move {
                    if cam.exposing.fetch_add(1, Ordering::SeqCst) > 0 {
                        cam.overlapped.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    cam.exposing.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .raw("echo", |_cam: Arc<Camera>, call: Call, _ctx| async move {
                    Ok(Value::List(vec![Value::List(call.args), Value::Map(call.kwargs)]))
                }),
        )
    }

    fn ctx() -> ObjectContext {
        ObjectContext::detached(Location::parse("127.0.0.1:7666/Camera/0").unwrap())
    }

    #[tokio::test]
    async fn test_typed_method_round_trip() {
        let cam = camera();
        let result = cam.invoke(&ctx(), Call::new("add", args![2, 3])).await.unwrap();
        assert_eq!(result, Value::Int(5));

        let result = cam.invoke(&ctx(), Call::new("ready", vec![])).await.unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[tokio::test]
    async fn test_bad_arguments_are_a_type_error() {
        let err = camera()
            .invoke(&ctx(), Call::new("add", args!["two"]))
            .await
            .unwrap_err();
        match err {
            InvokeError::Failed(failure) => assert_eq!(failure.kind, "TypeError"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_method() {
        let err = camera().invoke(&ctx(), Call::new("sub", args![2, 3])).await.unwrap_err();
        assert_eq!(err, InvokeError::MethodNotFound("sub".into()));
    }

    #[tokio::test]
    async fn test_method_failure_becomes_failure() {
        let err = camera().invoke(&ctx(), Call::new("fail", vec![])).await.unwrap_err();
        assert_eq!(
            err,
            InvokeError::Failed(crate::protocol::Failure::new("IOError", "shutter stuck"))
        );
    }

    #[tokio::test]
    async fn test_raw_method_sees_kwargs() {
        let call = Call::new("echo", args![1])
            .with_kwargs([("binning".to_string(), Value::Int(2))].into());
        let result = camera().invoke(&ctx(), call).await.unwrap();
        assert_eq!(
            result,
            Value::List(vec![
                Value::List(vec![Value::Int(1)]),
                Value::Map([("binning".to_string(), Value::Int(2))].into()),
            ])
        );
    }

    #[tokio::test]
    async fn test_locked_methods_never_overlap() {
        let cam = Arc::new(camera());
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cam = cam.clone();
            tasks.push(tokio::spawn(async move {
                cam.invoke(&ctx(), Call::new("expose", args![10])).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(cam.inner().overlapped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_names_sorted() {
        assert_eq!(camera().methods(), vec!["add", "echo", "expose", "fail", "ready"]);
    }
}
