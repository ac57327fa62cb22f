//! Fetch capabilities, the source registry, and the scraper task runner.
//!
//! This crate provides:
//! - [`capabilities`]: the [`FetchCapability`] trait and built-in sources
//!   (SAM.gov API, CSS listing pages, external commands, partner dossiers)
//! - [`SourceRegistry`]: validated source descriptors loaded from config
//! - [`TaskRunner`]: bounded, isolated, timed execution of every source

pub mod capabilities;
pub mod registry;
pub mod runner;

pub use capabilities::{
    CapabilityRegistry, CommandCapability, FetchCapability, FetchPayload, HtmlListingCapability,
    ListingSelectors, PartnerDossiersCapability, SamGovCapability, SourceParams,
    TESTING_MODE_PARAM, http_client, parse_dossier, parse_listing,
};
pub use registry::{InvalidSource, SourceDescriptor, SourceEntry, SourceRegistry};
pub use runner::{RunAllOutcome, SourceTiming, TaskReport, TaskRunner, normalize_payload, run_one};
