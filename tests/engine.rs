use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::TimeDelta;
use memonce::{
    Container, Contract, Engine, Field, Identity, OnceError, Property, Routing, failures,
    human_duration, timeline,
};
use parking_lot::Mutex;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A build script with two paths to `link` and `compile`.
struct Build {
    steps: Mutex<Vec<&'static str>>,
    compiles: AtomicUsize,
    links: AtomicUsize,
}

impl Build {
    fn new() -> Self {
        Self {
            steps: Mutex::new(Vec::new()),
            compiles: AtomicUsize::new(0),
            links: AtomicUsize::new(0),
        }
    }
}

#[derive(Clone)]
struct BuildOnce {
    inner: Arc<Build>,
    engine: Engine,
}

impl BuildOnce {
    fn contract() -> Contract {
        Contract::new("Build")
            .field("steps", Field::Immutable)
            .field("compiles", Field::Immutable)
            .field("links", Field::Immutable)
            .method("compile", Routing::Intercepted)
            .method("link", Routing::Intercepted)
            .method("test", Routing::Intercepted)
            .method("package", Routing::Intercepted)
    }

    async fn compile(&self) -> Result<(), OnceError> {
        let inner = self.inner.clone();
        self.engine
            .call_async(Identity::method("Build", "compile", &())?, move || async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                inner.compiles.fetch_add(1, Ordering::SeqCst);
                inner.steps.lock().push("compile");
                Ok(())
            })
            .await
    }

    async fn link(&self) -> Result<(), OnceError> {
        let this = self.clone();
        self.engine
            .call_async(Identity::method("Build", "link", &())?, move || async move {
                this.compile().await?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                this.inner.links.fetch_add(1, Ordering::SeqCst);
                this.inner.steps.lock().push("link");
                Ok(())
            })
            .await
    }

    async fn test(&self) -> Result<(), OnceError> {
        let this = self.clone();
        self.engine
            .call_async(Identity::method("Build", "test", &())?, move || async move {
                this.link().await?;
                this.inner.steps.lock().push("test");
                Ok(())
            })
            .await
    }

    async fn package(&self) -> Result<(), OnceError> {
        let this = self.clone();
        self.engine
            .call_async(Identity::method("Build", "package", &())?, move || async move {
                this.link().await?;
                this.inner.steps.lock().push("package");
                Ok(())
            })
            .await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn build_steps_execute_once_across_paths() -> Result<(), OnceError> {
    init_logging();
    let container = Container::new();
    let inner = Arc::new(Build::new());
    let build = container.wrap(&BuildOnce::contract(), |engine| BuildOnce {
        inner: inner.clone(),
        engine,
    })?;

    // `test` and `package` both reach `link` (and through it `compile`),
    // yet each step runs exactly once.
    build.test().await?;
    build.package().await?;

    assert_eq!(inner.compiles.load(Ordering::SeqCst), 1);
    assert_eq!(inner.links.load(Ordering::SeqCst), 1);
    assert_eq!(
        *inner.steps.lock(),
        vec!["compile", "link", "test", "package"]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn timeline_reports_completed_batch() -> Result<(), OnceError> {
    let container = Container::new();
    let build = container.wrap(&BuildOnce::contract(), |engine| BuildOnce {
        inner: Arc::new(Build::new()),
        engine,
    })?;
    build.test().await?;
    build.package().await?;

    let report = timeline(&build.engine.invocations());
    assert!(report.contains("Summary"));
    assert!(report.contains("success:  true"));
    assert!(report.contains("compile"));
    assert!(report.contains("package"));
    assert!(report.contains('#'));
    Ok(())
}

struct HelloOnce {
    engine: Engine,
    count: Arc<AtomicUsize>,
}

impl HelloOnce {
    fn contract() -> Contract {
        Contract::new("Hello").method("greet", Routing::Intercepted)
    }

    fn greet(&self, name: &str) -> Result<String, OnceError> {
        let count = self.count.clone();
        self.engine
            .call(Identity::method("Hello", "greet", &(name,))?, move || {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(format!("Hello, {name}"))
            })
    }
}

#[test]
fn method_is_only_called_once() {
    let container = Container::new();
    let count = Arc::new(AtomicUsize::new(0));
    let hello = container
        .wrap(&HelloOnce::contract(), |engine| HelloOnce {
            engine,
            count: count.clone(),
        })
        .unwrap();

    assert_eq!(hello.greet("Alice").unwrap(), "Hello, Alice");
    assert_eq!(hello.greet("Alice").unwrap(), "Hello, Alice");
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Different arguments are a different identity.
    assert_eq!(hello.greet("Bob").unwrap(), "Hello, Bob");
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[derive(Clone)]
struct CounterOnce {
    engine: Engine,
    hits: Arc<AtomicUsize>,
}

impl CounterOnce {
    fn contract() -> Contract {
        Contract::new("Counter").method("value", Routing::Intercepted)
    }

    async fn value(&self) -> Result<u64, OnceError> {
        let hits = self.hits.clone();
        self.engine
            .call_async(Identity::method("Counter", "value", &())?, move || async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            })
            .await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_execution() -> Result<(), OnceError> {
    let container = Container::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = container.wrap(&CounterOnce::contract(), |engine| CounterOnce {
        engine,
        hits: hits.clone(),
    })?;

    let mut waiters = Vec::new();
    for _ in 0..8 {
        let counter = counter.clone();
        waiters.push(tokio::spawn(async move { counter.value().await }));
    }
    for waiter in waiters {
        assert_eq!(waiter.await.expect("task panicked")?, 42);
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

struct GreeterOnce {
    engine: Engine,
}

impl GreeterOnce {
    fn contract() -> Contract {
        Contract::new("Greeter")
            .method("greet", Routing::Intercepted)
            .property(
                "name",
                Property {
                    settable: true,
                    intercepted_getter: true,
                },
            )
    }

    fn name(&self) -> Result<String, OnceError> {
        self.engine
            .get(Identity::getter("Greeter", "name"), || "world".to_string())
    }

    fn set_name(&self, value: &str) -> Result<(), OnceError> {
        self.engine
            .set(Identity::setter("Greeter", "name"), value.to_string())
    }

    fn greet(&self) -> Result<String, OnceError> {
        let name = self.name()?;
        self.engine
            .call(Identity::method("Greeter", "greet", &())?, || {
                Ok(format!("Hello, {name}!"))
            })
    }
}

#[test]
fn property_can_only_be_set_before_first_get() {
    let container = Container::new();
    let greeter = container
        .wrap(&GreeterOnce::contract(), |engine| GreeterOnce { engine })
        .unwrap();

    // Setting before any read is permitted and repeatable.
    greeter.set_name("Alice").unwrap();
    greeter.set_name("Bob").unwrap();
    assert_eq!(greeter.name().unwrap(), "Bob");

    // The first read froze the value.
    let err = greeter.set_name("Carol").unwrap_err();
    assert!(matches!(err, OnceError::SetAfterFirstGet { .. }));
    assert_eq!(greeter.name().unwrap(), "Bob");
}

#[test]
fn instance_can_be_configured_through_properties() {
    let container = Container::new();
    let greeter = container
        .wrap(&GreeterOnce::contract(), |engine| GreeterOnce { engine })
        .unwrap();

    greeter.set_name("Alice").unwrap();
    assert_eq!(greeter.greet().unwrap(), "Hello, Alice!");

    let err = greeter.set_name("Bob").unwrap_err();
    assert!(matches!(err, OnceError::SetAfterFirstGet { .. }));
}

#[test]
fn unset_property_reads_its_default() {
    let container = Container::new();
    let greeter = container
        .wrap(&GreeterOnce::contract(), |engine| GreeterOnce { engine })
        .unwrap();

    assert_eq!(greeter.greet().unwrap(), "Hello, world!");
    let err = greeter.set_name("Alice").unwrap_err();
    assert!(matches!(err, OnceError::SetAfterFirstGet { .. }));
}

#[test]
fn mutable_field_fails_to_wrap() {
    let contract = Contract::new("AClassThatHasMutableFields")
        .field("i", Field::Mutable)
        .method("hello", Routing::Intercepted);

    let container = Container::new();
    let result = container.wrap(&contract, |engine| engine);
    match result {
        Err(OnceError::Configuration { type_name, violations }) => {
            assert_eq!(type_name, "AClassThatHasMutableFields");
            assert!(violations.iter().any(|v| v.contains("`i`")));
        }
        _ => panic!("expected a configuration error"),
    }
}

#[test]
fn configuration_errors_are_aggregated() {
    let contract = Contract::new("Unsound")
        .field("state", Field::Mutable)
        .method("helper", Routing::Direct)
        .property(
            "mode",
            Property {
                settable: true,
                intercepted_getter: false,
            },
        );

    let container = Container::new();
    let err = container.wrap(&contract, |engine| engine).unwrap_err();
    match err {
        OnceError::Configuration { violations, .. } => {
            assert_eq!(violations.len(), 3);
        }
        _ => panic!("expected a configuration error"),
    }
}

#[derive(Clone)]
struct FlakyOnce {
    engine: Engine,
    attempts: Arc<AtomicUsize>,
}

impl FlakyOnce {
    fn contract() -> Contract {
        Contract::new("Flaky").method("always_fails", Routing::Intercepted)
    }

    async fn always_fails(&self) -> Result<(), OnceError> {
        let attempts = self.attempts.clone();
        self.engine
            .call_async(
                Identity::method("Flaky", "always_fails", &())?,
                move || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("epic fail"))
                },
            )
            .await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_is_cached_and_replayed() -> Result<(), OnceError> {
    init_logging();
    let container = Container::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let flaky = container.wrap(&FlakyOnce::contract(), |engine| FlakyOnce {
        engine,
        attempts: attempts.clone(),
    })?;

    let first = flaky.always_fails().await.unwrap_err();
    let second = flaky.always_fails().await.unwrap_err();

    assert_eq!(first.to_string(), second.to_string());
    match (&first, &second) {
        (
            OnceError::InvocationFailed { cause: a, .. },
            OnceError::InvocationFailed { cause: b, .. },
        ) => {
            // Replayed, not re-raised: both callers hold the same cause.
            assert!(Arc::ptr_eq(a, b));
            assert_eq!(a.root_cause().to_string(), "epic fail");
        }
        _ => panic!("expected cached invocation failures"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let report = failures(&flaky.engine.invocations());
    assert!(report.contains("always_fails"));
    assert!(report.contains("epic fail"));
    assert!(report.ends_with("FAILED\n"));

    let report = timeline(&flaky.engine.invocations());
    assert!(report.contains("success:  false"));
    assert!(report.contains("Failed"));
    Ok(())
}

/// A build whose `compile` step is broken; `link` reaches it through the
/// wrapper, so its own failure merely wraps `compile`'s.
#[derive(Clone)]
struct BrokenBuildOnce {
    engine: Engine,
}

impl BrokenBuildOnce {
    fn contract() -> Contract {
        Contract::new("BrokenBuild")
            .method("compile", Routing::Intercepted)
            .method("link", Routing::Intercepted)
    }

    async fn compile(&self) -> Result<(), OnceError> {
        self.engine
            .call_async(Identity::method("BrokenBuild", "compile", &())?, || async {
                Err(anyhow::anyhow!("syntax error in main.c"))
            })
            .await
    }

    async fn link(&self) -> Result<(), OnceError> {
        let this = self.clone();
        self.engine
            .call_async(Identity::method("BrokenBuild", "link", &())?, move || async move {
                this.compile().await?;
                Ok(())
            })
            .await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_failure_reports_the_deepest_cause_once() -> Result<(), OnceError> {
    let container = Container::new();
    let build = container.wrap(&BrokenBuildOnce::contract(), |engine| BrokenBuildOnce {
        engine,
    })?;

    assert!(build.link().await.is_err());

    // Only `compile` carries a real reason; `link`'s failure is just the
    // wrapped propagation and gets no row of its own.
    let report = failures(&build.engine.invocations());
    assert!(report.contains("target compile failed. Reason: syntax error in main.c"));
    assert!(!report.contains("target link failed"));
    assert!(report.ends_with("FAILED\n"));
    Ok(())
}

#[test]
fn non_encodable_arguments_are_a_configuration_error() {
    // JSON object keys must be strings; a tuple-keyed map has no canonical
    // encoding.
    let mut table = BTreeMap::new();
    table.insert((1u32, 2u32), 3u32);

    let err = Identity::method("Grid", "lookup", &(table,)).unwrap_err();
    match err {
        OnceError::Configuration { violations, .. } => {
            assert!(violations.iter().any(|v| v.contains("lookup")));
        }
        _ => panic!("expected a configuration error"),
    }
}

#[derive(Clone)]
struct PanickyOnce {
    engine: Engine,
    attempts: Arc<AtomicUsize>,
}

impl PanickyOnce {
    fn contract() -> Contract {
        Contract::new("Panicky").method("detonate", Routing::Intercepted)
    }

    async fn detonate(&self) -> Result<(), OnceError> {
        let attempts = self.attempts.clone();
        self.engine
            .call_async(
                Identity::method("Panicky", "detonate", &())?,
                move || async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    panic!("kaboom");
                },
            )
            .await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn panic_in_execution_becomes_a_cached_failure() -> Result<(), OnceError> {
    let container = Container::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let panicky = container.wrap(&PanickyOnce::contract(), |engine| PanickyOnce {
        engine,
        attempts: attempts.clone(),
    })?;

    // The panic surfaces as a cached failure for every caller instead of
    // unwinding into them.
    let first = panicky.detonate().await.unwrap_err();
    let second = panicky.detonate().await.unwrap_err();
    match (&first, &second) {
        (
            OnceError::InvocationFailed { cause: a, .. },
            OnceError::InvocationFailed { cause: b, .. },
        ) => {
            assert!(Arc::ptr_eq(a, b));
        }
        _ => panic!("expected cached invocation failures"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    Ok(())
}

#[derive(Clone)]
struct HangOnce {
    engine: Engine,
}

impl HangOnce {
    fn contract() -> Contract {
        Contract::new("Hang").method("hang", Routing::Intercepted)
    }

    async fn hang(&self) -> Result<(), OnceError> {
        self.engine
            .call_async(Identity::method("Hang", "hang", &())?, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_releases_waiters() -> Result<(), OnceError> {
    let container = Container::new();
    let hang = container.wrap(&HangOnce::contract(), |engine| HangOnce { engine })?;

    let waiter = {
        let hang = hang.clone();
        tokio::spawn(async move { hang.hang().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    container.cancel_all();

    let released = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter was not released")
        .expect("waiter panicked");
    assert!(matches!(released, Err(OnceError::Cancelled { .. })));
    Ok(())
}

#[test]
fn human_readable_durations() {
    assert_eq!(human_duration(TimeDelta::milliseconds(250)), "250ms");
    assert_eq!(human_duration(TimeDelta::seconds(5)), "5s");
    assert_eq!(human_duration(TimeDelta::minutes(1)), "60s");
    assert_eq!(human_duration(TimeDelta::seconds(90)), "1m30s");
    assert_eq!(human_duration(TimeDelta::minutes(45)), "45m");
    assert_eq!(
        human_duration(TimeDelta::hours(3) + TimeDelta::minutes(10)),
        "3h10m"
    );
    assert_eq!(human_duration(TimeDelta::days(2)), "2d0h");
    assert_eq!(human_duration(TimeDelta::days(20)), "20d");
}
