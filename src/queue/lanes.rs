use rand::Rng;
use serde::{Serialize, Deserialize};

use super::Lane;

/// Relative dispatch weights of the three priority lanes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneWeights {
    pub critical: u32,
    pub default: u32,
    pub low: u32,
}

impl Default for LaneWeights {
    fn default() -> Self {
        // 60% / 30% / 10%
        Self {
            critical: 6,
            default: 3,
            low: 1,
        }
    }
}

impl LaneWeights {
    pub fn weight(&self, lane: Lane) -> u32 {
        match lane {
            Lane::Critical => self.critical,
            Lane::Default => self.default,
            Lane::Low => self.low,
        }
    }

    pub fn total(&self) -> u32 {
        Lane::ALL.iter().map(|lane| self.weight(*lane)).sum()
    }

    /// Order in which to poll the lanes for the next lease
    ///
    /// The first lane is drawn with probability proportional to its weight;
    /// the other two follow in priority order so an empty lane never stalls
    /// a worker.
    pub fn pick_order<R: Rng + ?Sized>(&self, rng: &mut R) -> [Lane; 3] {
        let total = self.total();
        if total == 0 {
            return Lane::ALL;
        }

        let roll = rng.gen_range(0..total);
        let mut acc = 0;
        let mut first = Lane::Low;
        for lane in Lane::ALL {
            acc += self.weight(lane);
            if roll < acc {
                first = lane;
                break;
            }
        }

        let mut order = [first; 3];
        let mut rest = Lane::ALL.into_iter().filter(|lane| *lane != first);
        for slot in order.iter_mut().skip(1) {
            if let Some(lane) = rest.next() {
                *slot = lane;
            }
        }

        order
    }
}
