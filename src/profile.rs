use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Error;
use crate::traits::ProfileStore;
use crate::types::{Profile, ProfileUpdate, SubjectId};

struct ProfileCache {
    /// Subject the cache belongs to. Results for anyone else are dropped.
    subject: Option<SubjectId>,
    profile: Option<Profile>,
    /// Ticket of the newest refresh whose result was published.
    published: u64,
}

impl ProfileCache {
    fn profile_of(&self, subject: &SubjectId) -> Option<Profile> {
        self.profile.clone().filter(|p| &p.id == subject)
    }
}

/// A refresh whose place in line is already fixed.
///
/// Obtained from [`ProfileLoader::ticket`]; redeem with
/// [`ProfileLoader::fetch`].
#[derive(Debug)]
#[must_use = "a ticket does nothing until fetched"]
pub(crate) struct RefreshTicket {
    seq: u64,
    subject: SubjectId,
}

/// Fetches and caches the profile row of the signed-in subject.
///
/// Every refresh draws a ticket when it is *called*. A result is published
/// only if no refresh with a higher ticket has been published already, so
/// overlapping refreshes resolve last-write-wins by call order.
///
/// The cache is bound to one subject. Drawing a ticket for another subject
/// rebinds it (dropping the old profile), and results for a subject the cache
/// is no longer bound to are discarded.
///
/// Fetch errors never clear a known-good profile: the cached value is kept and
/// returned.
pub struct ProfileLoader<P> {
    store: Arc<P>,
    cache: Mutex<ProfileCache>,
    next_ticket: AtomicU64,
}

impl<P: ProfileStore> ProfileLoader<P> {
    #[must_use]
    pub fn new(store: Arc<P>) -> Self {
        Self {
            store,
            cache: Mutex::new(ProfileCache {
                subject: None,
                profile: None,
                published: 0,
            }),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Cached profile.
    #[must_use]
    pub fn current(&self) -> Option<Profile> {
        self.lock().profile.clone()
    }

    /// Fetch the profile row for `subject`.
    ///
    /// The ticket is taken before the returned future is first polled.
    /// Resolves to the cached profile of `subject` after the fetch: the
    /// fetched row, `None` if the row does not exist, or the unchanged
    /// previous value on error or when a newer refresh already won.
    pub fn refresh(
        &self,
        subject: &SubjectId,
    ) -> impl Future<Output = Option<Profile>> + Send + use<'_, P> {
        let ticket = self.ticket(subject);
        self.fetch(ticket)
    }

    /// Take a place in line for a refresh of `subject` without fetching yet.
    pub(crate) fn ticket(&self, subject: &SubjectId) -> RefreshTicket {
        let seq = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let mut cache = self.lock();
        if cache.subject.as_ref() != Some(subject) {
            tracing::debug!(subject = %subject, "Profile cache bound to new subject");
            cache.subject = Some(subject.clone());
            cache.profile = None;
            cache.published = seq;
        }
        RefreshTicket {
            seq,
            subject: subject.clone(),
        }
    }

    /// Run the refresh `ticket` stands for.
    pub(crate) async fn fetch(&self, ticket: RefreshTicket) -> Option<Profile> {
        let result = self.store.select_profile_by_id(&ticket.subject).await;
        self.publish(&ticket, result)
    }

    /// Write `fields` and then refresh.
    ///
    /// # Errors
    ///
    /// Returns the store error if the write fails; the cache is untouched.
    pub async fn update(
        &self,
        subject: &SubjectId,
        fields: &ProfileUpdate,
    ) -> Result<Option<Profile>, Error> {
        self.store.update_profile(subject, fields).await?;
        Ok(self.refresh(subject).await)
    }

    /// Drop the cached profile, unbind the subject and invalidate every
    /// in-flight refresh.
    pub fn clear(&self) {
        let seq = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let mut cache = self.lock();
        cache.subject = None;
        cache.profile = None;
        cache.published = seq;
    }

    fn publish(
        &self,
        ticket: &RefreshTicket,
        result: Result<Option<Profile>, Error>,
    ) -> Option<Profile> {
        let subject = &ticket.subject;
        let mut cache = self.lock();
        if cache.subject.as_ref() != Some(subject) {
            tracing::debug!(subject = %subject, "Discarding profile refresh for a previous subject");
            return None;
        }
        if ticket.seq < cache.published {
            tracing::debug!(
                subject = %subject,
                ticket = ticket.seq,
                published = cache.published,
                "Discarding stale profile refresh"
            );
            return cache.profile_of(subject);
        }

        match result {
            Ok(Some(profile)) if &profile.id == subject => {
                cache.profile = Some(profile);
                cache.published = ticket.seq;
            }
            Ok(Some(profile)) => {
                tracing::error!(
                    subject = %subject,
                    returned = %profile.id,
                    "Profile store returned another subject's row"
                );
            }
            Ok(None) => {
                tracing::info!(subject = %subject, "Profile row not found yet");
                cache.profile = None;
                cache.published = ticket.seq;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    class = ?e.class(),
                    subject = %subject,
                    "Profile refresh failed, keeping cached profile"
                );
            }
        }
        cache.profile_of(subject)
    }

    fn lock(&self) -> MutexGuard<'_, ProfileCache> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
