// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

//! `Arbitrary` impls for the property tests in §8, gated the same way the
//! source crate gates its own generators: available under `cfg(test)` or the
//! `arb` feature, never compiled into a release build by default.

use quickcheck::Arbitrary;

use crate::model::{Interface, Rate};
use crate::timestamp::Timestamp;

/// Interface/node name fragment, restricted to the alphabet the HTTP shell's
/// own validation regex allows (`[A-Za-z0-9_ -]+`, §6) so generated values
/// look like real node and interface names rather than arbitrary Unicode.
#[derive(Clone, Debug)]
pub struct ArbToken(pub String);

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789-_";

impl Arbitrary for ArbToken {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let len = 1 + usize::arbitrary(g) % 8;
        let s: String = (0..len)
            .map(|_| {
                let idx = usize::arbitrary(g) % ALPHABET.len();
                ALPHABET[idx] as char
            })
            .collect();
        ArbToken(s)
    }
}

/// An interface id shaped like the parser expects: `<letters><digits>/<digits>`.
#[derive(Clone, Debug)]
pub struct ArbInterfaceId(pub String);

impl Arbitrary for ArbInterfaceId {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let prefix = ArbToken::arbitrary(g).0;
        let a = 1 + u8::arbitrary(g) % 48;
        let b = 1 + u8::arbitrary(g) % 48;
        ArbInterfaceId(format!("{prefix}{a}/{b}"))
    }
}

#[derive(Clone, Debug)]
pub struct ArbInterface(pub Interface);

impl Arbitrary for ArbInterface {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let node = ArbToken::arbitrary(g).0;
        let interface = ArbInterfaceId::arbitrary(g).0;
        let description = ArbToken::arbitrary(g).0;
        ArbInterface(Interface::new(node, interface, description))
    }
}

#[derive(Clone, Debug)]
pub struct ArbRate(pub Rate);

impl Arbitrary for ArbRate {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        ArbRate(Rate {
            in_bps: f64::from(u32::arbitrary(g) % 10_000_000),
            out_bps: f64::from(u32::arbitrary(g) % 10_000_000),
            bandwidth_bps: f64::from(u32::arbitrary(g) % 100_000_000),
            datasource: "telemetry",
            timestamp: Timestamp::arbitrary(g),
        })
    }
}
