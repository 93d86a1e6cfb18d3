//! Fresh-identifier minting for the renaming and injection passes.
//!
//! An allocator draws one candidate from the random source shaped by the
//! configured scheme; on collision it falls back to appending a monotonically
//! increasing counter until the name is unique within the scope. Accepted
//! names are registered into the scope so later calls cannot re-collide.

use crate::random::RandomSource;
use modshield_config::{NamingScheme, RenamingMode};
use std::collections::HashSet;

const CONFUSABLE: &[char] = &['l', 'I', '1', 'i', '|'];
const ZERO_WIDTH: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{200E}', '\u{200F}'];

/// What kind of member a minted name will be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameIntent {
    Type,
    Method,
    Field,
    Property,
    Event,
}

/// The avoid-set for one naming scope (a module's type names, one type's
/// member names, and so on).
#[derive(Debug, Default, Clone)]
pub struct NameScope {
    used: HashSet<String>,
}

impl NameScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the scope with the names that already exist.
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            used: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.used.contains(name)
    }

    pub fn register(&mut self, name: impl Into<String>) {
        self.used.insert(name.into());
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

/// Mints fresh identifiers under a cosmetic scheme and intensity.
#[derive(Debug)]
pub struct NameAllocator {
    scheme: NamingScheme,
    intensity: RenamingMode,
    counter: u64,
}

impl NameAllocator {
    pub fn new(scheme: NamingScheme, intensity: RenamingMode) -> Self {
        Self {
            scheme,
            intensity,
            counter: 0,
        }
    }

    /// A fresh identifier distinct from everything in `scope`. The accepted
    /// name is registered into the scope before it is returned.
    pub fn mint(
        &mut self,
        rng: &mut RandomSource,
        scope: &mut NameScope,
        intent: NameIntent,
    ) -> String {
        let candidate = self.draw(rng, intent);
        let name = if scope.contains(&candidate) {
            loop {
                self.counter += 1;
                let suffixed = format!("{candidate}{}", self.counter);
                if !scope.contains(&suffixed) {
                    break suffixed;
                }
            }
        } else {
            candidate
        };
        scope.register(name.clone());
        name
    }

    fn draw_len(&self, rng: &mut RandomSource) -> usize {
        let (min, max) = match self.intensity {
            RenamingMode::None | RenamingMode::Light => (4, 10),
            RenamingMode::Normal => (6, 16),
            RenamingMode::Aggressive => (8, 25),
        };
        rng.next_int(min, max + 1) as usize
    }

    fn draw(&mut self, rng: &mut RandomSource, intent: NameIntent) -> String {
        let len = self.draw_len(rng);
        match self.scheme {
            NamingScheme::Alphanumeric => {
                let mut name = String::with_capacity(len);
                name.push(first_char(rng, intent));
                while name.len() < len {
                    name.push(alphanumeric_char(rng));
                }
                name
            }
            NamingScheme::Confusable => (0..len)
                .map(|_| CONFUSABLE[rng.next_int(0, CONFUSABLE.len() as i64) as usize])
                .collect(),
            NamingScheme::Invisible => {
                let mut name = String::from("_");
                for _ in 0..len {
                    name.push(ZERO_WIDTH[rng.next_int(0, ZERO_WIDTH.len() as i64) as usize]);
                }
                name
            }
            NamingScheme::Simple => (0..len)
                .map(|_| (b'a' + rng.next_int(0, 26) as u8) as char)
                .collect(),
        }
    }
}

/// First character restricted to letters; types additionally start uppercase
/// so minted type names read like type names.
fn first_char(rng: &mut RandomSource, intent: NameIntent) -> char {
    match intent {
        NameIntent::Type => (b'A' + rng.next_int(0, 26) as u8) as char,
        _ => {
            let i = rng.next_int(0, 53);
            match i {
                0..=25 => (b'A' + i as u8) as char,
                26..=51 => (b'a' + (i - 26) as u8) as char,
                _ => '_',
            }
        }
    }
}

fn alphanumeric_char(rng: &mut RandomSource) -> char {
    let i = rng.next_int(0, 62);
    match i {
        0..=25 => (b'A' + i as u8) as char,
        26..=51 => (b'a' + (i - 26) as u8) as char,
        _ => (b'0' + (i - 52) as u8) as char,
    }
}
