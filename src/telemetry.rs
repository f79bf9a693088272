/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Tracing init, called once from the process entry point. Stdout logging
//! via `tracing-subscriber` is always on; OTLP export is layered in behind
//! the `telemetry` feature when the config names an endpoint.

use crate::{config::Config, error::TelemetryError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "telemetry")]
use opentelemetry::KeyValue;
#[cfg(feature = "telemetry")]
use opentelemetry_sdk::Resource;

pub async fn init(config: &Config) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();

    #[cfg(feature = "telemetry")]
    {
        if let Some(otlp_layer) = build_otlp_layer(config)? {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .with(otlp_layer)
                .try_init()?;
            return Ok(());
        }
    }
    #[cfg(not(feature = "telemetry"))]
    let _ = config;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[cfg(feature = "telemetry")]
fn build_otlp_layer(
    config: &Config,
) -> Result<
    Option<tracing_opentelemetry::OpenTelemetryLayer<tracing_subscriber::Registry, opentelemetry_sdk::trace::Tracer>>,
    TelemetryError,
> {
    let Some(grpc_endpoint) = config
        .telemetry
        .as_ref()
        .and_then(|t| t.endpoint.as_ref())
        .and_then(|e| e.grpc_endpoint.as_deref())
    else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(grpc_endpoint)
        .build()?;

    let resource = Resource::builder()
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            config.instance_name(),
        ))
        .build();

    let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    let tracer = opentelemetry::trace::TracerProvider::tracer(&provider, "call-media-bridge");

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}
