//! Firmware core for a gateway that bridges a legacy analog telephone (POTS
//! handset, driven through an AG1171 SLIC) to a Bluetooth Hands-Free link
//! provided by a Microchip BM64 module.
//!
//! Three state machines carry the whole system: the BM64 packet codec
//! ([`protocols::bm64`]), the POTS line machine ([`pots`]) and the Bluetooth
//! link machine ([`bt`]). The [`scheduler`] drives them cooperatively (POTS
//! every 10 ms, BT every 20 ms) and the [`cmd`] module exposes a small serial
//! command surface for pairing-slot selection and link diagnostics.
//!
//! Everything in this library is hardware-independent; the board binds it to
//! real pins and UARTs through the [`hardware::Port`] trait. No code here
//! allocates: buffers are fixed-size arrays or `heapless` collections.

#![no_std]

pub mod bt;
pub mod cfg_storage;
pub mod cmd;
pub mod hardware;
pub mod pots;
pub mod protocols;
pub mod scheduler;

#[cfg(feature = "board")]
pub mod board;
