//! Remote typing presence.
//!
//! Tracks which other participants of the selected chat are typing. Entries
//! expire a fixed interval after their last refresh, whether or not the
//! explicit stop event ever arrives.
//!
//! Each refresh issues a new [`TimerToken`]. A timer firing with a superseded
//! token is ignored, so refreshing an entry cancels its previous timer.

use std::{collections::BTreeMap, time::Duration};

use lessonhub_core::{ChatId, Instant, TypingUser, UserId};

/// How long a typing entry lives after its last refresh.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// Identifies one scheduled expiry of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(u64);

#[derive(Debug, Clone)]
struct TypingEntry<I> {
    display_name: String,
    expires_at: I,
    token: TimerToken,
}

/// Time-bounded set of users typing in one chat.
#[derive(Debug, Clone)]
pub struct TypingTracker<I> {
    chat_id: Option<ChatId>,
    self_id: UserId,
    entries: BTreeMap<UserId, TypingEntry<I>>,
    next_token: u64,
}

impl<I: Instant> TypingTracker<I> {
    /// Tracker that ignores events authored by `self_id`.
    pub fn new(self_id: UserId) -> Self {
        Self { chat_id: None, self_id, entries: BTreeMap::new(), next_token: 0 }
    }

    /// Rebind to a chat and forget every entry.
    pub fn reset(&mut self, chat_id: Option<ChatId>) {
        self.chat_id = chat_id;
        self.entries.clear();
    }

    /// Change the local user after re-authentication.
    pub fn set_self(&mut self, self_id: UserId) {
        self.self_id = self_id;
        self.entries.remove(&self_id);
    }

    /// Chat the tracker is bound to.
    pub fn chat_id(&self) -> Option<ChatId> {
        self.chat_id
    }

    /// Add or refresh a typing user.
    ///
    /// Returns the new timer token and its deadline, or `None` when the event
    /// is for another chat or from the local user.
    pub fn on_typing(
        &mut self,
        chat_id: ChatId,
        user: TypingUser,
        now: I,
    ) -> Option<(TimerToken, I)> {
        if self.chat_id != Some(chat_id) || user.user_id == self.self_id {
            return None;
        }

        self.next_token += 1;
        let token = TimerToken(self.next_token);
        let expires_at = now + TYPING_TIMEOUT;
        let entry = TypingEntry { display_name: user.display_name, expires_at, token };
        self.entries.insert(user.user_id, entry);
        Some((token, expires_at))
    }

    /// Remove a user immediately. Returns `true` if they were typing.
    pub fn on_typing_stop(&mut self, chat_id: ChatId, user_id: UserId) -> bool {
        self.chat_id == Some(chat_id) && self.entries.remove(&user_id).is_some()
    }

    /// Handle a fired expiry timer.
    ///
    /// Removes the entry only if `token` is still current.
    pub fn on_timer(&mut self, user_id: UserId, token: TimerToken) -> bool {
        if self.entries.get(&user_id).is_some_and(|e| e.token == token) {
            self.entries.remove(&user_id);
            return true;
        }
        false
    }

    /// Users typing at `now`, ordered by user ID.
    ///
    /// Entries past their deadline are hidden even before their timer
    /// fires.
    pub fn typing_users(&self, now: I) -> Vec<TypingUser> {
        self.entries
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .map(|(&user_id, e)| TypingUser { user_id, display_name: e.display_name.clone() })
            .collect()
    }

    /// Whether anyone is tracked, expired or not.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant as StdInstant;

    use super::*;

    fn user(user_id: UserId, name: &str) -> TypingUser {
        TypingUser { user_id, display_name: name.into() }
    }

    fn tracker() -> TypingTracker<StdInstant> {
        let mut tracker = TypingTracker::new(1);
        tracker.reset(Some(10));
        tracker
    }

    #[test]
    fn own_events_are_ignored() {
        let mut tracker = tracker();
        assert!(tracker.on_typing(10, user(1, "Me"), StdInstant::now()).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn other_chats_are_ignored() {
        let mut tracker = tracker();
        assert!(tracker.on_typing(11, user(2, "Bo"), StdInstant::now()).is_none());
        assert!(!tracker.on_typing_stop(11, 2));
    }

    #[test]
    fn entry_expires_after_timeout() {
        let mut tracker = tracker();
        let now = StdInstant::now();
        let (token, deadline) = tracker.on_typing(10, user(2, "Bo"), now).unwrap();

        assert_eq!(deadline, now + TYPING_TIMEOUT);
        assert_eq!(tracker.typing_users(now + Duration::from_millis(2999)), vec![user(2, "Bo")]);
        assert!(tracker.typing_users(deadline).is_empty());
        assert!(tracker.on_timer(2, token));
        assert!(tracker.is_empty());
    }

    #[test]
    fn timer_after_stop_is_ignored() {
        let mut tracker = tracker();
        let (token, _) = tracker.on_typing(10, user(2, "Bo"), StdInstant::now()).unwrap();
        tracker.on_typing_stop(10, 2);
        assert!(!tracker.on_timer(2, token));
    }

    #[test]
    fn refresh_cancels_previous_timer() {
        let mut tracker = tracker();
        let now = StdInstant::now();
        let (first, _) = tracker.on_typing(10, user(2, "Bo"), now).unwrap();
        let (second, deadline) =
            tracker.on_typing(10, user(2, "Bo"), now + Duration::from_secs(2)).unwrap();

        assert_ne!(first, second);
        assert_eq!(deadline, now + Duration::from_secs(5));
        assert!(!tracker.on_timer(2, first));
        assert_eq!(tracker.typing_users(now + Duration::from_secs(4)).len(), 1);
        assert!(tracker.on_timer(2, second));
    }

    #[test]
    fn stop_removes_immediately() {
        let mut tracker = tracker();
        let now = StdInstant::now();
        tracker.on_typing(10, user(2, "Bo"), now);
        tracker.on_typing(10, user(3, "Cy"), now);

        assert!(tracker.on_typing_stop(10, 2));
        assert_eq!(tracker.typing_users(now), vec![user(3, "Cy")]);
    }

    #[test]
    fn reset_clears_entries() {
        let mut tracker = tracker();
        let now = StdInstant::now();
        tracker.on_typing(10, user(2, "Bo"), now);
        tracker.reset(Some(11));

        assert!(tracker.is_empty());
        assert_eq!(tracker.chat_id(), Some(11));
    }
}
