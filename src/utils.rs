// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rand::RngExt;

/// Seeds a Friend/LPN counter with a random starting point so that
/// friendship credential derivations differ across reboots.
pub fn random_counter() -> u16 {
    rand::rng().random()
}
