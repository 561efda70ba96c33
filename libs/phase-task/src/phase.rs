// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The eight ordered stages of one host loop iteration.

use bitflags::bitflags;
use core::fmt;

/// One stage of a host loop iteration.
///
/// The host drives `Init` and `PostInit` once at startup and then the remaining six phases once
/// per iteration, in declaration order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Phase {
    Init = 0,
    PostInit = 1,
    PreUpdate = 2,
    Update = 3,
    PostUpdate = 4,
    PreRender = 5,
    Render = 6,
    PostRender = 7,
}

bitflags! {
    /// A set of [`Phase`]s a pending continuation is allowed to run in.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct PhaseMask: u8 {
        const INIT = 1 << 0;
        const POST_INIT = 1 << 1;
        const PRE_UPDATE = 1 << 2;
        const UPDATE = 1 << 3;
        const POST_UPDATE = 1 << 4;
        const PRE_RENDER = 1 << 5;
        const RENDER = 1 << 6;
        const POST_RENDER = 1 << 7;

        const ALL = 0xFF;
    }
}

// === impl Phase ===

impl Phase {
    /// Every phase in the order the host drives them.
    pub const ORDERED: [Phase; 8] = [
        Phase::Init,
        Phase::PostInit,
        Phase::PreUpdate,
        Phase::Update,
        Phase::PostUpdate,
        Phase::PreRender,
        Phase::Render,
        Phase::PostRender,
    ];

    /// The single-phase mask selecting only `self`.
    #[must_use]
    pub const fn mask(self) -> PhaseMask {
        PhaseMask::from_bits_retain(1 << self as u8)
    }

    /// Returns the phase at `index` in [`Phase::ORDERED`].
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < Self::ORDERED.len() {
            Some(Self::ORDERED[index])
        } else {
            None
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::PostInit => "post-init",
            Phase::PreUpdate => "pre-update",
            Phase::Update => "update",
            Phase::PostUpdate => "post-update",
            Phase::PreRender => "pre-render",
            Phase::Render => "render",
            Phase::PostRender => "post-render",
        };
        f.write_str(name)
    }
}

// === impl PhaseMask ===

impl PhaseMask {
    /// Returns `true` if a continuation carrying this mask may run during `phase`.
    #[must_use]
    pub const fn includes(self, phase: Phase) -> bool {
        self.bits() & phase.mask().bits() != 0
    }

    /// Iterates the phases selected by this mask, in loop order.
    pub fn phases(self) -> impl Iterator<Item = Phase> {
        Phase::ORDERED
            .into_iter()
            .filter(move |phase| self.includes(*phase))
    }
}

impl Default for PhaseMask {
    fn default() -> Self {
        PhaseMask::UPDATE
    }
}

impl From<Phase> for PhaseMask {
    fn from(phase: Phase) -> Self {
        phase.mask()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn single_phase_masks_line_up_with_named_flags() {
        assert_eq!(Phase::Init.mask(), PhaseMask::INIT);
        assert_eq!(Phase::Update.mask(), PhaseMask::UPDATE);
        assert_eq!(Phase::PostRender.mask(), PhaseMask::POST_RENDER);
        assert_eq!(PhaseMask::default(), PhaseMask::UPDATE);
    }

    #[test]
    fn all_includes_every_phase() {
        for phase in Phase::ORDERED {
            assert!(PhaseMask::ALL.includes(phase));
            assert!(!PhaseMask::empty().includes(phase));
        }
    }

    #[test]
    fn phases_iterates_in_loop_order() {
        let mask = PhaseMask::RENDER | PhaseMask::INIT | PhaseMask::UPDATE;
        let phases: Vec<_> = mask.phases().collect();
        assert_eq!(phases, [Phase::Init, Phase::Update, Phase::Render]);
    }

    #[test]
    fn from_index() {
        assert_eq!(Phase::from_index(3), Some(Phase::Update));
        assert_eq!(Phase::from_index(8), None);
    }
}
