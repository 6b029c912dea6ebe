use aide::openapi::{OpenApi, Operation, SchemaObject, StatusCode};
use axum::http::Method;
use schemars::{
	gen::SchemaGenerator,
	schema::{Schema, SchemaObject as JsonSchemaObject},
	JsonSchema,
};

/// Generate the schema of `T`, letting `cb` adjust each top-level property (name, schema, position).
pub fn schema_with_properties<T: JsonSchema>(
	generator: &mut SchemaGenerator,
	cb: impl Fn(String, &mut JsonSchemaObject, usize),
) -> Schema {
	let mut schema = generator.root_schema_for::<T>().schema;
	let metadata = schema.metadata();

	metadata.title = Some(metadata.title.as_ref().map_or_else(
		|| T::schema_name(),
		|title| title.split('_').next().unwrap_or(title).to_string(),
	));

	let object = schema.object();
	for (index, (name, property)) in object.properties.clone().into_iter().enumerate() {
		let mut property: JsonSchemaObject = property.into_object();

		cb(name.clone(), &mut property, index);
		object.properties.insert(name, property.into());
	}

	Schema::Object(schema)
}

fn operation_mut<'a>(api: &'a mut OpenApi, path: &str, method: &Method) -> Option<&'a mut Operation> {
	let paths = api.paths.as_mut()?;
	let item = paths.paths.get_mut(path)?.as_item_mut()?;

	match *method {
		Method::GET => item.get.as_mut(),
		Method::PUT => item.put.as_mut(),
		Method::POST => item.post.as_mut(),
		Method::HEAD => item.head.as_mut(),
		Method::TRACE => item.trace.as_mut(),
		Method::DELETE => item.delete.as_mut(),
		Method::OPTIONS => item.options.as_mut(),
		_ => None,
	}
}

pub fn replace_request_schema(
	api: &mut OpenApi,
	path: &str,
	(method, media_type): (Method, &str),
	schema: JsonSchemaObject,
) -> Option<()> {
	let operation = operation_mut(api, path, &method)?;
	let body = operation.request_body.as_mut()?.as_item_mut()?;

	body.content.get_mut(media_type)?.schema = Some(SchemaObject {
		example: None,
		external_docs: None,
		json_schema: Schema::Object(schema),
	});

	Some(())
}

pub fn replace_response_schema(
	api: &mut OpenApi,
	path: &str,
	(method, status_code, media_type): (Method, StatusCode, &str),
	json_schema: JsonSchemaObject,
) -> Option<()> {
	let operation = operation_mut(api, path, &method)?;
	let responses = operation.responses.as_mut()?;
	let response = responses.responses.get_mut(&status_code)?.as_item_mut()?;

	response.content.get_mut(media_type)?.schema = Some(SchemaObject {
		example: None,
		external_docs: None,
		json_schema: Schema::Object(json_schema),
	});

	Some(())
}
