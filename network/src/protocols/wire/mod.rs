// Copyright (c) TerraGraf Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol for message framing, serialization and negotiation

pub mod codec;
pub mod handshake;

pub use codec::{BincodeFormatter, MessageCodec, MessageFormatter};
pub use handshake::{Handshake, Negotiation, NegotiationVerdict};
