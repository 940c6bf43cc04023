// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The 64-bit gateway status word (§3, §6).

use bitflags::bitflags;

bitflags! {
    /// Each bit is independently readable/writable; writers use
    /// [`StatusWord::compare_and_set`] so concurrent bit flips never race.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusWord: u64 {
        const READY                    = 1 << 1;
        const SERVICE_IF_AVAILABLE     = 1 << 2;
        const CUSTOMER_IF_AVAILABLE    = 1 << 3;
        const WIRELESS_MBUS_AVAILABLE  = 1 << 8;
        const WIRED_MBUS_AVAILABLE     = 1 << 9;
        const TIME_VALID               = 1 << 12;
        const AUTHENTICATED            = 1 << 16;
    }
}

impl StatusWord {
    /// Atomically sets or clears `mask` against `word`, returning the new
    /// value and whether it actually changed.
    ///
    /// `fetch_update` resolves to the *previous* value on success, not the
    /// updated one, so the new value is recomputed from the closure's last
    /// evaluation rather than trusted from its return.
    pub fn compare_and_set(word: &std::sync::atomic::AtomicU64, mask: Self, on: bool) -> (Self, bool) {
        use std::sync::atomic::Ordering;
        let mut changed = false;
        let mut next_bits = 0u64;
        word.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
            let cur = Self::from_bits_retain(raw);
            let next = if on { cur | mask } else { cur & !mask };
            changed = next != cur;
            next_bits = next.bits();
            Some(next_bits)
        })
        .expect("closure always returns Some, so fetch_update never fails");
        (Self::from_bits_retain(next_bits), changed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;

    #[test]
    fn compare_and_set_reports_change() {
        let w = AtomicU64::new(0);
        let (v, changed) = StatusWord::compare_and_set(&w, StatusWord::READY, true);
        assert!(changed);
        assert!(v.contains(StatusWord::READY));

        let (_, changed_again) = StatusWord::compare_and_set(&w, StatusWord::READY, true);
        assert!(!changed_again);
    }
}
