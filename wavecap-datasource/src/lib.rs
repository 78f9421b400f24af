//! Datasource layer for wavecap capture helpers.
//!
//! An adapter implements [`CaptureSource`] and hands it to
//! [`run_adapter`]; everything else (argument resolution, transport
//! selection, the command handlers, the report plumbing, shutdown) lives
//! here. Source definition parsing and identifier derivation are in
//! [`definition`].

pub mod adapter;
pub mod args;
pub mod definition;
pub mod source;

pub use crate::{
    adapter::{
        AdapterError,
        run_adapter,
    },
    args::{
        ArgsError,
        CommonArgs,
        etc_directory,
    },
    definition::{
        SourceOptions,
        make_uuid,
        parse_definition,
    },
    source::{
        CallbackResult,
        CaptureSource,
        ConfigureResult,
        Datasource,
        DatasourceHandle,
        OpenResult,
        ProbeResult,
    },
};
