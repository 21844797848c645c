//! Streamer discovery and selection

/// Result of a streamer list: what is joinable and what would be picked
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamerCatalog {
    pub streamers: Vec<String>,
    pub auto_selection: Option<String>,
    pub wanted: Option<String>,
}

impl StreamerCatalog {
    pub fn new(streamers: Vec<String>, wanted: Option<String>, wait_for_streamer: bool) -> Self {
        let auto_selection = select_streamer(&streamers, wanted.as_deref(), wait_for_streamer);
        Self {
            streamers,
            auto_selection,
            wanted,
        }
    }

    /// Rename an entry after `streamerIdChanged`
    pub fn rename(&mut self, old_id: &str, new_id: &str) {
        for id in self.streamers.iter_mut().filter(|id| id.as_str() == old_id) {
            *id = new_id.to_string();
        }
        if self.auto_selection.as_deref() == Some(old_id) {
            self.auto_selection = Some(new_id.to_string());
        }
    }
}

/// Pick a streamer from `streamers`
///
/// The wanted one if present; otherwise the only one, unless we were asked
/// to wait for a specific streamer.
pub fn select_streamer(
    streamers: &[String],
    wanted: Option<&str>,
    wait_for_streamer: bool,
) -> Option<String> {
    if let Some(wanted) = wanted {
        if streamers.iter().any(|s| s == wanted) {
            return Some(wanted.to_string());
        }
    }
    if (wanted.is_none() || !wait_for_streamer) && streamers.len() == 1 {
        return streamers.first().cloned();
    }
    None
}

/// Pinned id wins over the previously subscribed one
pub fn resolve_wanted(pinned: Option<&str>, previous: Option<&str>) -> Option<String> {
    pinned
        .filter(|id| !id.is_empty())
        .or(previous)
        .map(str::to_string)
}

/// What to do after a streamer list arrives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListDecision {
    /// Already subscribed to the selection in this session
    KeepSubscription,
    Subscribe(String),
    /// Ask again later; carries the new attempt count
    Requery(u32),
    /// Out of attempts
    GiveUp,
    /// Nothing to select and not waiting
    NoSelection,
}

/// Decide how to react to `catalog`
pub fn decide(
    catalog: &StreamerCatalog,
    active_subscription: Option<&str>,
    wait_for_streamer: bool,
    auto_join_attempt: u32,
    max_attempts: u32,
) -> ListDecision {
    match catalog.auto_selection {
        Some(ref id) if active_subscription == Some(id.as_str()) => ListDecision::KeepSubscription,
        Some(ref id) => ListDecision::Subscribe(id.clone()),
        None if wait_for_streamer => {
            if auto_join_attempt < max_attempts {
                ListDecision::Requery(auto_join_attempt + 1)
            } else {
                ListDecision::GiveUp
            }
        }
        None => ListDecision::NoSelection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_wanted_first() {
        assert_eq!(
            select_streamer(&ids(&["A", "B"]), Some("B"), true),
            Some("B".to_string())
        );
    }

    #[test]
    fn test_select_single_entry() {
        assert_eq!(select_streamer(&ids(&["A"]), None, true), Some("A".to_string()));
        // Waiting for a specific streamer that is not there
        assert_eq!(select_streamer(&ids(&["A"]), Some("B"), true), None);
        assert_eq!(
            select_streamer(&ids(&["A"]), Some("B"), false),
            Some("A".to_string())
        );
        assert_eq!(select_streamer(&ids(&["A", "C"]), None, false), None);
        assert_eq!(select_streamer(&[], None, false), None);
    }

    #[test]
    fn test_resolve_wanted() {
        assert_eq!(resolve_wanted(Some("P"), Some("S")), Some("P".to_string()));
        assert_eq!(resolve_wanted(Some(""), Some("S")), Some("S".to_string()));
        assert_eq!(resolve_wanted(None, None), None);
    }

    #[test]
    fn test_decide() {
        let catalog = StreamerCatalog::new(ids(&["A"]), None, true);
        assert_eq!(
            decide(&catalog, None, true, 0, 3),
            ListDecision::Subscribe("A".to_string())
        );
        assert_eq!(
            decide(&catalog, Some("A"), true, 0, 3),
            ListDecision::KeepSubscription
        );

        let catalog = StreamerCatalog::new(ids(&["A"]), Some("B".to_string()), true);
        assert_eq!(decide(&catalog, None, true, 0, 3), ListDecision::Requery(1));
        assert_eq!(decide(&catalog, None, true, 3, 3), ListDecision::GiveUp);
        assert_eq!(decide(&catalog, None, false, 0, 3), ListDecision::NoSelection);

        let catalog = StreamerCatalog::new(ids(&["A", "C"]), None, false);
        assert_eq!(decide(&catalog, None, false, 0, 3), ListDecision::NoSelection);
    }

    #[test]
    fn test_catalog_rename() {
        let mut catalog = StreamerCatalog::new(ids(&["A", "C"]), Some("A".to_string()), true);
        catalog.rename("A", "B");
        assert_eq!(catalog.streamers, ids(&["B", "C"]));
        assert_eq!(catalog.auto_selection.as_deref(), Some("B"));
    }
}
