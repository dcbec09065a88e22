/// Named milestones of the request state machine, in firing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Pass,
    Lookup,
    Hit,
    Miss,
    Fetch,
    Validate,
    Store,
    Deliver,
    Error,
}

impl Event {
    const ALL: [Event; 9] = [
        Event::Pass,
        Event::Lookup,
        Event::Hit,
        Event::Miss,
        Event::Fetch,
        Event::Validate,
        Event::Store,
        Event::Deliver,
        Event::Error,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Event::Pass => "pass",
            Event::Lookup => "lookup",
            Event::Hit => "hit",
            Event::Miss => "miss",
            Event::Fetch => "fetch",
            Event::Validate => "validate",
            Event::Store => "store",
            Event::Deliver => "deliver",
            Event::Error => "error",
        }
    }
}

/// Bitset of events fired during one `call`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u16);

impl EventSet {
    pub fn record(&mut self, event: Event) {
        self.0 |= event.bit();
    }

    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Fired events in declaration order, for trace lines and access logs.
    pub fn fired(self) -> impl Iterator<Item = Event> {
        Event::ALL
            .into_iter()
            .filter(move |event| self.contains(*event))
    }
}
