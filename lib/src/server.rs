use std::{net::SocketAddr, sync::Arc};

use aide::openapi::{self, OpenApi};
use anyhow::Result;
use axum::{http::Method, Extension, Server};
use indexmap::indexmap;
use schemars::{
	gen::{SchemaGenerator, SchemaSettings},
	schema::SchemaObject as Schema,
};
use segserve_core::{
	http::{PredictionInput, Request, Response},
	InstanceSegmentation, ModelConfig, PredictionRecord,
};

use crate::{
	helpers::openapi::{replace_request_schema, replace_response_schema, schema_with_properties},
	prediction::Prediction,
	routes,
	shutdown::Shutdown,
};

/// Print the OpenAPI document of the server to stdout.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn dump_schema() -> Result<()> {
	let mut openapi = generate_schema();
	let _ = routes::handler().finish_api(&mut openapi);
	tweak_generated_schema(&mut openapi);

	println!("{}", serde_json::to_string(&openapi)?);

	Ok(())
}

/// Serve predictions of `M` on `port` until shutdown.
///
/// # Errors
///
/// Returns an error if the shutdown handler or the prediction runner cannot be created, or if the server fails to bind.
pub async fn start<M: InstanceSegmentation>(config: ModelConfig, port: u16) -> Result<()> {
	let shutdown = Shutdown::new()?;
	let prediction = Prediction::setup::<M>(config, shutdown.clone())?;

	let mut openapi = generate_schema();
	let router = routes::handler().finish_api(&mut openapi);
	tweak_generated_schema(&mut openapi);

	let router = router
		.layer(prediction.extension())
		.layer(shutdown.extension())
		.layer(Extension(Arc::new(openapi)));

	let addr = SocketAddr::from(([0, 0, 0, 0], port));

	tracing::info!("Starting server on {addr}...");
	Server::bind(&addr)
		.serve(router.into_make_service())
		.with_graceful_shutdown(shutdown.handle())
		.await?;

	Ok(())
}

fn generate_schema() -> OpenApi {
	let mut generator = SchemaGenerator::new(SchemaSettings::openapi3().with(|settings| {
		settings.inline_subschemas = true;
	}));

	OpenApi {
		info: openapi::Info {
			title: "segserve".to_string(),
			version: env!("CARGO_PKG_VERSION").to_string(),
			..openapi::Info::default()
		},
		components: Some(openapi::Components {
			schemas: indexmap! {
				"Input".to_string() => openapi::SchemaObject {
					example: None,
					external_docs: None,
					json_schema: schema_with_properties::<PredictionInput>(&mut generator, |name, schema, i| {
						schema.metadata().title = Some(titlecase::titlecase(&name.replace('_', " ")));
						schema.extensions.insert("x-order".to_string(), i.into());
					})
				},
				"PredictionRequest".to_string() => openapi::SchemaObject {
					example: None,
					external_docs: None,
					json_schema: schema_with_properties::<Request>(&mut generator, |name, schema, _| {
						if name == "input" {
							schema.reference = Some("#/components/schemas/Input".to_string());
						}
					})
				},
				"Output".to_string() => openapi::SchemaObject {
					example: None,
					external_docs: None,
					json_schema: generator.subschema_for::<Vec<PredictionRecord>>()
				},
				"PredictionResponse".to_string() => openapi::SchemaObject {
					example: None,
					external_docs: None,
					json_schema: schema_with_properties::<Response>(&mut generator, |name, schema, _| {
						if name == "input" {
							schema.reference = Some("#/components/schemas/Input".to_string());
						}

						if name == "output" {
							schema.reference = Some("#/components/schemas/Output".to_string());
						}
					})
				},
			},
			..openapi::Components::default()
		}),
		..OpenApi::default()
	}
}

fn tweak_generated_schema(openapi: &mut OpenApi) {
	for path in ["/predictions", "/predictions/{prediction_id}"] {
		let method = if path == "/predictions" {
			Method::POST
		} else {
			Method::PUT
		};

		if replace_request_schema(
			openapi,
			path,
			(method.clone(), "application/json"),
			Schema::new_ref("#/components/schemas/PredictionRequest".to_string()),
		)
		.is_none()
		{
			tracing::warn!("No request schema to replace for {method} {path}");
		}

		if replace_response_schema(
			openapi,
			path,
			(method.clone(), openapi::StatusCode::Code(200), "application/json"),
			Schema::new_ref("#/components/schemas/PredictionResponse".to_string()),
		)
		.is_none()
		{
			tracing::warn!("No response schema to replace for {method} {path}");
		}
	}
}
