// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

pub use palimpsest::*;

#[cfg(test)]
mod test;

// The end-to-end tests live outside the crate for two reasons:
//
//  1. to make sure the public API is usable without accidentally relying on
//     crate-level-visibility stuff.
//
//  2. to exercise whole command scripts through the same entry point the
//     binary uses, asserting on the exact output text.

use std::io::{self, Write};

pub fn main() -> io::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    run(stdin.lock(), &mut out)?;
    out.flush()
}
