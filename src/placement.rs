// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! This module defines the fixed variable-to-site layout and the small
//! arithmetic derived from it. It's tiny but everything else keys off it,
//! and layout arithmetic is exactly the sort of fiddly indexing that's easy
//! to get off-by-one, so it gets its own module and an exhaustive test.

use serde::{Deserialize, Serialize};

/// Number of variables in the database, numbered `1..=NUM_VARIABLES`.
pub const NUM_VARIABLES: u32 = 20;

/// Number of storage sites, numbered `1..=NUM_SITES`.
pub const NUM_SITES: u32 = 10;

/// Initial value of variable `x_i` is `INITIAL_VALUE_MULTIPLIER * i`,
/// committed at time zero.
pub const INITIAL_VALUE_MULTIPLIER: i64 = 10;

/// Identifies one of the twenty variables. Prints as `x4` in operation
/// output, which is also how command scripts spell it.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl std::fmt::Debug for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("x{}", self.0))
    }
}

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("x{}", self.0))
    }
}

/// Identifies one of the ten sites.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteId(pub u32);

impl std::fmt::Debug for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("s{}", self.0))
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

/// Odd-indexed variables live at exactly one site; even-indexed variables
/// are fully replicated at all sites.
pub fn is_replicated(var: VarId) -> bool {
    var.0 % 2 == 0
}

/// The single site hosting an unreplicated variable: `1 + (i mod NUM_SITES)`.
/// Also defined (but not meaningful as a sole host) for replicated variables.
pub fn home_site(var: VarId) -> SiteId {
    SiteId(1 + (var.0 % NUM_SITES))
}

/// The set of sites hosting `var`, in ascending order.
pub fn placement(var: VarId) -> Vec<SiteId> {
    if is_replicated(var) {
        all_sites().collect()
    } else {
        vec![home_site(var)]
    }
}

/// Whether `site` holds a copy of `var`.
pub fn hosts(site: SiteId, var: VarId) -> bool {
    is_replicated(var) || home_site(var) == site
}

/// The value every copy of `var` holds at time zero.
pub fn initial_value(var: VarId) -> i64 {
    INITIAL_VALUE_MULTIPLIER * var.0 as i64
}

pub fn all_sites() -> impl Iterator<Item = SiteId> {
    (1..=NUM_SITES).map(SiteId)
}

pub fn all_vars() -> impl Iterator<Item = VarId> {
    (1..=NUM_VARIABLES).map(VarId)
}
