use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccupancySet {
    present: BTreeSet<String>,
}

impl OccupancySet {
    pub fn mark_present(&mut self, id: &str) -> bool {
        if self.present.contains(id) {
            return false;
        }
        self.present.insert(id.to_string())
    }

    pub fn mark_away(&mut self, id: &str) -> bool {
        self.present.remove(id)
    }

    pub fn reset(&mut self) {
        self.present.clear();
    }

    pub fn count(&self) -> usize {
        self.present.len()
    }

    pub fn is_anyone_home(&self) -> bool {
        !self.present.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.present.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let mut set = OccupancySet::default();
        assert!(set.mark_present("phone-a"));
        assert!(!set.mark_present("phone-a"));
        assert_eq!(set.count(), 1);
        assert!(set.is_anyone_home());
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut set = OccupancySet::default();
        set.mark_present("phone-a");
        assert!(!set.mark_away("phone-b"));
        assert_eq!(set.count(), 1);
        assert!(set.mark_away("phone-a"));
        assert_eq!(set.count(), 0);
    }

    #[test]
    fn reset_clears_everyone() {
        let mut set = OccupancySet::default();
        set.mark_present("a");
        set.mark_present("b");
        set.reset();
        assert_eq!(set.count(), 0);
        assert_eq!(set.ids().count(), 0);
    }
}
