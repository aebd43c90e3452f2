use crate::save::SaveMetadata;

/// The saves to delete so that only `keep` remain, least recently used first.
///
/// Age is the last-played time, or the creation time for never-played saves.
pub fn select_victims(saves: &[SaveMetadata], keep: usize) -> Vec<&SaveMetadata> {
    if saves.len() <= keep {
        return Vec::new();
    }
    let mut by_age: Vec<&SaveMetadata> = saves.iter().collect();
    by_age.sort_by_key(|s| (s.last_activity(), s.slot));
    by_age.truncate(saves.len() - keep);
    by_age
}
