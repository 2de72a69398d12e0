//! Pipeline stages for organising scanned pages.
//!
//! Each submodule implements one step. The OCR engine sits behind
//! [`reader::OcrEngine`].
//!
//! ## Data Flow
//!
//! ```text
//! source ──▶ cache? ──▶ region ──▶ reader ──▶ classify ──▶ assemble ──▶ cache
//! (listing)  (skip)     (crop)     (OCR)      (+ ledger)   (PDF)        (record)
//!                                                 │             ▲
//!                                                 └─▶ correction┘
//! ```
//!
//! 1. [`source`]: list, sort and fingerprint the input images
//! 2. [`cache`]: skip images whose fingerprint and output are unchanged
//! 3. [`region`]: orient the scan and crop the sheet-number band
//! 4. [`reader`]: OCR the band (and the full page) and parse a number
//! 5. [`classify`]: turn the reading into a decision; [`ledger`] serializes
//!    output claims and exposes the preceding image's decision
//! 6. [`correction`]: ask a human when classification cannot decide
//! 7. [`assemble`]: write the single-page PDF atomically

pub mod assemble;
pub mod cache;
pub mod classify;
pub mod correction;
pub mod ledger;
pub mod reader;
pub mod region;
pub mod source;
