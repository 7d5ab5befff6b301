use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    astronomy::AstronomyState,
    time::{resolve_symbol, Clock, TimeSymbol},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Start,
    End,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::End => "END",
        }
    }
}

pub type EdgeCallback = Box<dyn FnMut(EventKind)>;

pub struct Task {
    start_text: String,
    end_text: String,
    start: TimeSymbol,
    end: TimeSymbol,
    on_edge: EdgeCallback,
}

impl Task {
    pub fn new(start: &str, end: &str, on_edge: impl FnMut(EventKind) + 'static) -> Self {
        Self {
            start_text: start.to_string(),
            end_text: end.to_string(),
            start: TimeSymbol::parse(start),
            end: TimeSymbol::parse(end),
            on_edge: Box::new(on_edge),
        }
    }

    // As registered, before lenient parsing.
    pub fn start(&self) -> &str {
        &self.start_text
    }

    pub fn end(&self) -> &str {
        &self.end_text
    }

    pub fn symbol(&self, event: EventKind) -> TimeSymbol {
        match event {
            EventKind::Start => self.start,
            EventKind::End => self.end,
        }
    }

    pub fn references_astronomy(&self) -> bool {
        self.start.is_astronomical() || self.end.is_astronomical()
    }

    pub fn fire(&mut self, event: EventKind) {
        (self.on_edge)(event);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("start", &self.start_text)
            .field("end", &self.end_text)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
}

impl TaskRegistry {
    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Task> {
        self.tasks.iter_mut()
    }

    pub fn first_mut(&mut self) -> Option<&mut Task> {
        self.tasks.first_mut()
    }

    /// Strict bounds. A task with an unresolved astronomical endpoint never
    /// matches.
    pub fn is_active_window<C: Clock + ?Sized>(
        &self,
        clock: &C,
        astronomy: &AstronomyState,
        now: i64,
    ) -> bool {
        self.tasks.iter().any(|task| {
            let toggle_on = resolve_symbol(clock, &task.start, astronomy);
            let toggle_off = resolve_symbol(clock, &task.end, astronomy);
            matches!((toggle_on, toggle_off), (Some(on), Some(off)) if on < now && now < off)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::test_support::{epoch, FakeClock};

    fn window_task(start: &str, end: &str) -> Task {
        Task::new(start, end, |_| {})
    }

    #[test]
    fn window_bounds_are_exclusive() {
        let clock = FakeClock::at(epoch(2026, 4, 2, 11, 0, 0), 0);
        let astronomy = AstronomyState::default();
        let mut registry = TaskRegistry::default();
        registry.push(window_task("10:00", "12:00"));

        assert!(registry.is_active_window(&clock, &astronomy, epoch(2026, 4, 2, 11, 0, 0)));
        assert!(!registry.is_active_window(&clock, &astronomy, epoch(2026, 4, 2, 10, 0, 0)));
        assert!(!registry.is_active_window(&clock, &astronomy, epoch(2026, 4, 2, 12, 0, 0)));
    }

    #[test]
    fn empty_registry_is_never_active() {
        let clock = FakeClock::at(epoch(2026, 4, 2, 11, 0, 0), 0);
        let registry = TaskRegistry::default();
        assert!(!registry.is_active_window(&clock, &AstronomyState::default(), clock.now()));
    }

    #[test]
    fn any_matching_task_activates() {
        let clock = FakeClock::at(epoch(2026, 4, 2, 20, 0, 0), 0);
        let astronomy = AstronomyState::default();
        let mut registry = TaskRegistry::default();
        registry.push(window_task("6:00", "8:00"));
        registry.push(window_task("19:00", "23:00"));

        assert!(registry.is_active_window(&clock, &astronomy, clock.now()));
    }

    #[test]
    fn astronomical_windows_use_cached_times() {
        let clock = FakeClock::at(epoch(2026, 4, 2, 20, 0, 0), 0);
        let mut astronomy = AstronomyState::default();
        let mut registry = TaskRegistry::default();
        registry.push(window_task("sunset", "23:00"));

        assert!(!registry.is_active_window(&clock, &astronomy, clock.now()));

        astronomy.commit(epoch(2026, 4, 2, 6, 30, 0), epoch(2026, 4, 2, 19, 45, 0));
        assert!(registry.is_active_window(&clock, &astronomy, clock.now()));
    }

    #[test]
    fn detects_astronomy_references() {
        assert!(window_task("sunrise", "9:00").references_astronomy());
        assert!(window_task("18:00", "sunset").references_astronomy());
        assert!(!window_task("18:00", "22:00").references_astronomy());
    }

    #[test]
    fn fire_invokes_callback_with_event() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut task = Task::new("8:00", "9:00", move |event| sink.borrow_mut().push(event));

        task.fire(EventKind::Start);
        task.fire(EventKind::End);

        assert_eq!(*seen.borrow(), vec![EventKind::Start, EventKind::End]);
        assert_eq!(task.symbol(EventKind::End).to_string(), "9:00");
    }

    #[test]
    fn keeps_registered_text() {
        let task = window_task("08:00", "noon");

        assert_eq!(task.start(), "08:00");
        assert_eq!(task.end(), "noon");
        assert_eq!(task.symbol(EventKind::Start), TimeSymbol::Clock { hour: 8, minute: 0 });
        assert_eq!(task.symbol(EventKind::End), TimeSymbol::Clock { hour: 0, minute: 0 });
    }
}
