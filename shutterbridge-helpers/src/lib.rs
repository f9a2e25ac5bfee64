pub mod timer;

/// Identifies one command issued to a shutter. Anything scheduled on behalf of a command carries
/// its generation and is ignored once a newer command has been issued.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Generation(u64);

/// Counter that hands out increasing generations.
#[derive(Debug, Default)]
pub struct Generations {
    current: Generation,
}

impl Generations {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn advance(&mut self) -> Generation {
        self.current = Generation(self.current.0 + 1);
        self.current
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.current == generation
    }
}
