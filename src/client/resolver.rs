//! Cached user lookups with in-flight de-duplication.

use std::{fmt, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tracing::debug;

use crate::rest::{RestCollaborator, RestError, UserInfo};

type Fetch = Shared<BoxFuture<'static, Result<UserInfo, Arc<RestError>>>>;

/// Resolves user ids to profile details.
///
/// A lookup returns the cached value, joins a fetch already running for the
/// same id, or starts a new fetch through the REST collaborator. Failures
/// are shared with every waiter but never cached.
pub struct UserResolver {
    rest: Arc<dyn RestCollaborator>,
    cache: DashMap<String, UserInfo>,
    in_flight: DashMap<String, Fetch>,
}

impl fmt::Debug for UserResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserResolver")
            .field("cached", &self.cache.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl UserResolver {
    /// Resolver backed by `rest`.
    #[must_use]
    pub fn new(rest: Arc<dyn RestCollaborator>) -> Self {
        Self {
            rest,
            cache: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    /// Cached details for `user_id`, without fetching.
    #[must_use]
    pub fn cached(&self, user_id: &str) -> Option<UserInfo> { self.cache.get(user_id).map(|info| info.clone()) }

    /// Resolve `user_id`.
    ///
    /// # Errors
    ///
    /// Returns the collaborator's error, shared between concurrent callers.
    pub async fn resolve(&self, user_id: &str) -> Result<UserInfo, Arc<RestError>> {
        if let Some(info) = self.cached(user_id) {
            return Ok(info);
        }
        let fetch = match self.in_flight.entry(user_id.to_owned()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                debug!(user_id, "fetching user info");
                let rest = Arc::clone(&self.rest);
                let id = user_id.to_owned();
                let fetch = async move { rest.user_info(&id).await.map_err(Arc::new) }
                    .boxed()
                    .shared();
                entry.insert(fetch.clone());
                fetch
            }
        };
        let result = fetch.await;
        if let Ok(info) = &result {
            self.cache.insert(user_id.to_owned(), info.clone());
        }
        self.in_flight.remove_if(user_id, |_, fetch| fetch.peek().is_some());
        result
    }

    /// Drop every cached entry.
    pub fn clear(&self) { self.cache.clear(); }
}
