//! Adapter between the cache core and a UI image view.
//!
//! The UI layer implements [`ImageSink`] on whatever widget shows the image
//! and wraps it in a [`CachedImageView`]. The view owns the `url`,
//! `username` and `password` properties; every change shows the placeholder
//! and starts a fresh resolve through an [`ImageManager`]. Results for a URL
//! that has since been replaced are discarded.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::coordinator::FetchError;
use crate::key::Credentials;
use crate::manager::ImageManager;

/// Capabilities a UI widget exposes to the cache.
///
/// Callbacks run on a Tokio worker thread while the view's state lock is
/// held: they must hand the work to the UI thread and must not call back
/// into the [`CachedImageView`].
pub trait ImageSink: Send + Sync + 'static {
    /// Display fetched image bytes. Decoding is the sink's job.
    fn set_image(&self, image: Bytes);

    /// Display the default image while nothing else is available.
    fn set_placeholder(&self);

    /// Display the error image. Not called for cancelled fetches.
    fn set_error(&self, error: &FetchError);
}

#[derive(Default)]
struct ViewState {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    generation: u64,
    load: Option<AbortHandle>,
}

struct ViewInner<S> {
    manager: ImageManager,
    sink: S,
    state: Mutex<ViewState>,
}

/// An image view bound to an [`ImageManager`].
///
/// Setters must be called from within a Tokio runtime. Each returns the
/// handle of the spawned load, or `None` when there is nothing to load.
pub struct CachedImageView<S: ImageSink> {
    inner: Arc<ViewInner<S>>,
}

impl<S: ImageSink> fmt::Debug for CachedImageView<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CachedImageView")
            .field("url", &state.url)
            .field("username", &state.username)
            .field("generation", &state.generation)
            .finish_non_exhaustive()
    }
}

impl<S: ImageSink> CachedImageView<S> {
    pub fn new(manager: ImageManager, sink: S) -> Self {
        Self {
            inner: Arc::new(ViewInner {
                manager,
                sink,
                state: Mutex::new(ViewState::default()),
            }),
        }
    }

    pub fn sink(&self) -> &S {
        &self.inner.sink
    }

    pub fn url(&self) -> Option<String> {
        self.inner.state.lock().url.clone()
    }

    pub fn username(&self) -> Option<String> {
        self.inner.state.lock().username.clone()
    }

    pub fn password(&self) -> Option<String> {
        self.inner.state.lock().password.clone()
    }

    /// Sets the URL and reloads. An empty or `None` URL just shows the placeholder.
    pub fn set_url(&self, url: Option<&str>) -> Option<JoinHandle<()>> {
        self.update(|state| state.url = url.map(str::to_owned))
    }

    pub fn set_username(&self, username: Option<&str>) -> Option<JoinHandle<()>> {
        self.update(|state| state.username = username.map(str::to_owned))
    }

    pub fn set_password(&self, password: Option<&str>) -> Option<JoinHandle<()>> {
        self.update(|state| state.password = password.map(str::to_owned))
    }

    /// Sets all three properties at once and reloads a single time.
    pub fn set_url_with_credentials(
        &self,
        url: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Option<JoinHandle<()>> {
        self.update(|state| {
            state.url = url.map(str::to_owned);
            state.username = username.map(str::to_owned);
            state.password = password.map(str::to_owned);
        })
    }

    fn update(&self, apply: impl FnOnce(&mut ViewState)) -> Option<JoinHandle<()>> {
        let mut state = self.inner.state.lock();
        apply(&mut state);
        state.generation += 1;
        if let Some(previous) = state.load.take() {
            // Only this view's wait is dropped; the shared fetch carries on.
            previous.abort();
        }
        self.inner.sink.set_placeholder();

        let url = state.url.clone().filter(|u| !u.is_empty())?;
        let credentials =
            Credentials::from_parts(state.username.as_deref(), state.password.as_deref());
        let generation = state.generation;

        let inner = Arc::clone(&self.inner);
        let load = tokio::spawn(async move {
            let result = inner.manager.resolve(&url, credentials.as_ref()).await;

            let state = inner.state.lock();
            if state.generation != generation {
                debug!(url = %url, "discarding result for replaced image URL");
                return;
            }
            match result {
                Ok(image) => inner.sink.set_image(image),
                Err(FetchError::Cancelled) => {
                    debug!(url = %url, "image load cancelled; keeping placeholder");
                }
                Err(e) => inner.sink.set_error(&e),
            }
        });
        state.load = Some(load.abort_handle());
        Some(load)
    }
}

impl<S: ImageSink> Drop for CachedImageView<S> {
    fn drop(&mut self) {
        if let Some(load) = self.inner.state.lock().load.take() {
            load.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::Semaphore;

    use crate::config::CacheConfig;
    use crate::http::StatusCode;
    use crate::transport::{FetchFuture, FetchRequest, NetworkError, Transport};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Placeholder,
        Image(Bytes),
        Error,
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }
    }

    impl ImageSink for RecordingSink {
        fn set_image(&self, image: Bytes) {
            self.events.lock().push(Event::Image(image));
        }

        fn set_placeholder(&self) {
            self.events.lock().push(Event::Placeholder);
        }

        fn set_error(&self, _error: &FetchError) {
            self.events.lock().push(Event::Error);
        }
    }

    /// URLs containing "slow" wait for a permit; "fail" returns 500.
    struct ScriptedTransport {
        slow_gate: Semaphore,
    }

    impl Transport for ScriptedTransport {
        fn fetch<'a>(&'a self, request: &'a FetchRequest) -> FetchFuture<'a> {
            Box::pin(async move {
                if request.url.contains("slow") {
                    let _permit = self.slow_gate.acquire().await.expect("gate closed");
                }
                if request.url.contains("fail") {
                    return Err(NetworkError::Status {
                        status: StatusCode::new(500),
                    });
                }
                let user = request
                    .credentials
                    .as_ref()
                    .map_or("anon", |c| c.username());
                Ok(Bytes::from(format!("{}|{user}", request.url)))
            })
        }
    }

    fn view() -> (CachedImageView<RecordingSink>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport {
            slow_gate: Semaphore::new(0),
        });
        let manager = ImageManager::with_transport(CacheConfig::new(), transport.clone()).unwrap();
        (CachedImageView::new(manager, RecordingSink::default()), transport)
    }

    #[tokio::test]
    async fn placeholder_then_image() {
        let (view, _) = view();
        view.set_url(Some("http://x/a.png")).unwrap().await.unwrap();
        assert_eq!(
            view.sink().events(),
            vec![
                Event::Placeholder,
                Event::Image(Bytes::from_static(b"http://x/a.png|anon"))
            ]
        );
        assert_eq!(view.url().as_deref(), Some("http://x/a.png"));
    }

    #[tokio::test]
    async fn failure_shows_error() {
        let (view, _) = view();
        view.set_url(Some("http://x/fail.png")).unwrap().await.unwrap();
        assert_eq!(view.sink().events(), vec![Event::Placeholder, Event::Error]);
    }

    #[tokio::test]
    async fn empty_url_only_shows_placeholder() {
        let (view, _) = view();
        assert!(view.set_url(Some("")).is_none());
        assert!(view.set_url(None).is_none());
        assert_eq!(
            view.sink().events(),
            vec![Event::Placeholder, Event::Placeholder]
        );
    }

    #[tokio::test]
    async fn replaced_url_result_is_discarded() {
        let (view, transport) = view();
        let stale = view.set_url(Some("http://x/slow.png")).unwrap();
        let fresh = view.set_url(Some("http://x/fast.png")).unwrap();
        fresh.await.unwrap();

        transport.slow_gate.add_permits(1);
        assert!(stale.await.unwrap_err().is_cancelled());

        assert_eq!(
            view.sink().events(),
            vec![
                Event::Placeholder,
                Event::Placeholder,
                Event::Image(Bytes::from_static(b"http://x/fast.png|anon"))
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_load_keeps_placeholder() {
        let (view, _) = view();
        let load = view.set_url(Some("http://x/slow.png")).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while view.inner.manager.coordinator().pending_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(view.inner.manager.cancel_all_operations(), 1);
        load.await.unwrap();
        assert_eq!(view.sink().events(), vec![Event::Placeholder]);
    }

    #[tokio::test]
    async fn credentials_flow_through() {
        let (view, _) = view();
        view.set_url_with_credentials(Some("http://x/me.png"), Some("alice"), Some("pw"))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(view.username().as_deref(), Some("alice"));
        assert_eq!(view.password().as_deref(), Some("pw"));
        assert_eq!(
            view.sink().events().last(),
            Some(&Event::Image(Bytes::from_static(b"http://x/me.png|alice")))
        );

        // Changing only the user is a fresh resolve under a different key.
        view.set_username(Some("bob")).unwrap().await.unwrap();
        assert_eq!(
            view.sink().events().last(),
            Some(&Event::Image(Bytes::from_static(b"http://x/me.png|bob")))
        );
    }
}
