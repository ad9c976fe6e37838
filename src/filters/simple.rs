//! Simple source, transform and sink filters.

use std::sync::Arc;
use std::time::Duration;

use crate::environment::{FilterContext, FilterCreationContext, InputPortRef, OutputPortRef};
use crate::error::Result;
use crate::filter::Filter;
use crate::filters::tap::{SampleTap, TapRecord, SAMPLE_TAP_SERVICE};
use crate::property::{PropertyHandler, PropertyValue};
use crate::sample::DataSample;
use crate::services::ServiceRegistry;

/// Datatype tag of the samples produced by [`PeriodicSource`].
pub const COUNTER_DATATYPE: &str = "example/counter";

/// A source emitting counter samples at a configurable frequency.
pub struct PeriodicSource {
    out_port: OutputPortRef,
    frequency: f64,
    counter: u64,
}

pub(crate) fn periodic_source(ctx: &mut FilterCreationContext<'_>) -> Result<Box<dyn Filter>> {
    let out_port = ctx.add_static_output_port("outPort")?;
    let frequency = ctx
        .property_collection()
        .define_property_with_handler(
            "frequency",
            PropertyValue::Float(4.0),
            "sample frequency [Hz]",
            PropertyHandler::Float {
                min: Some(0.1),
                max: Some(1000.0),
            },
        )?
        .as_float()
        .unwrap_or(4.0);
    Ok(Box::new(PeriodicSource {
        out_port,
        frequency,
        counter: 0,
    }))
}

impl Filter for PeriodicSource {
    fn on_start(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        self.counter = 0;
        self.frequency = ctx
            .property_collection()
            .get_property("frequency")?
            .as_float()
            .unwrap_or(4.0);
        ctx.start_timer(Duration::from_secs_f64(1.0 / self.frequency))
    }

    fn on_timer(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let payload = format!("sample {}", self.counter);
        self.counter += 1;
        let sample = DataSample::new(
            payload.into_bytes(),
            COUNTER_DATATYPE,
            DataSample::current_time(),
        );
        ctx.transmit(self.out_port, sample)
    }

    fn on_stop(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        ctx.stop_timer()
    }
}

/// Forwards every received sample unchanged.
pub struct PassThrough {
    in_port: InputPortRef,
    out_port: OutputPortRef,
}

pub(crate) fn pass_through(ctx: &mut FilterCreationContext<'_>) -> Result<Box<dyn Filter>> {
    let in_port = ctx.add_static_input_port("inPort")?;
    let out_port = ctx.add_static_output_port("outPort")?;
    Ok(Box::new(PassThrough { in_port, out_port }))
}

impl Filter for PassThrough {
    fn on_port_data_changed(
        &mut self,
        ctx: &mut FilterContext<'_>,
        port: InputPortRef,
    ) -> Result<()> {
        debug_assert_eq!(port, self.in_port);
        let sample = ctx.get_data(port, 0)?;
        ctx.transmit(self.out_port, sample)
    }
}

/// A sink with a configurable per-sample processing time. Received
/// samples are reported to the "SampleTap" service if one is registered.
pub struct CollectingSink {
    in_port: InputPortRef,
    sleep_seconds: f64,
    tap: Option<Arc<SampleTap>>,
    received: u64,
}

pub(crate) fn collecting_sink(ctx: &mut FilterCreationContext<'_>) -> Result<Box<dyn Filter>> {
    let in_port = ctx.add_static_input_port("inPort")?;
    let sleep_seconds = ctx
        .property_collection()
        .define_property_with_handler(
            "sleep_seconds",
            PropertyValue::Float(0.0),
            "simulated processing time per sample [s]",
            PropertyHandler::Float {
                min: Some(0.0),
                max: Some(60.0),
            },
        )?
        .as_float()
        .unwrap_or(0.0);
    Ok(Box::new(CollectingSink {
        in_port,
        sleep_seconds,
        tap: None,
        received: 0,
    }))
}

impl Filter for CollectingSink {
    fn on_open(&mut self, _ctx: &mut FilterContext<'_>) -> Result<()> {
        self.tap = ServiceRegistry::default()
            .get_service::<SampleTap>(SAMPLE_TAP_SERVICE)
            .ok();
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut FilterContext<'_>) -> Result<()> {
        self.received = 0;
        self.sleep_seconds = ctx
            .property_collection()
            .get_property("sleep_seconds")?
            .as_float()
            .unwrap_or(0.0);
        Ok(())
    }

    fn on_port_data_changed(
        &mut self,
        ctx: &mut FilterContext<'_>,
        port: InputPortRef,
    ) -> Result<()> {
        debug_assert_eq!(port, self.in_port);
        let sample = ctx.get_data(port, 0)?;
        if self.sleep_seconds > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(self.sleep_seconds));
        }
        self.received += 1;
        if let Some(tap) = &self.tap {
            tap.publish(TapRecord {
                filter: ctx.full_qualified_name().to_string(),
                received_time: DataSample::current_time(),
                sample,
            });
        }
        Ok(())
    }

    fn on_close(&mut self, _ctx: &mut FilterContext<'_>) -> Result<()> {
        self.tap = None;
        Ok(())
    }
}
