//! `TestCallset`: the reference callset used by the demo client and server.

use tracing::info;

use crate::client::{CallOptions, Client};
use crate::config::ClientConfig;
use crate::error::{RemoteError, Result};
use crate::schema::{CallsetDef, OperationSpec};
use crate::server::Server;
use crate::types::{FieldType, Record};

pub const NAME: &str = "TestCallset";

/// Wire id of the callset.
pub const ID: u16 = 1;

pub const ADD: &str = "add";
pub const HANDLER_ERROR: &str = "handlererror";
pub const SET_STRUCT: &str = "setstruct";

pub fn definition() -> CallsetDef {
    CallsetDef::new(NAME, ID)
        .operation(
            OperationSpec::new(ADD, 1)
                .arg("a", FieldType::Int32)
                .arg("b", FieldType::Int32)
                .returns("sum", FieldType::Int32),
        )
        .operation(OperationSpec::new(HANDLER_ERROR, 2))
        .operation(
            OperationSpec::new(SET_STRUCT, 3)
                .optional_arg("var_int32", FieldType::Int32)
                .optional_arg("var_uint32", FieldType::Uint32)
                .optional_arg("var_int64", FieldType::Int64)
                .optional_arg("var_uint64", FieldType::Uint64)
                .optional_arg("var_bool", FieldType::Bool)
                .optional_arg("var_uint32_array", FieldType::array(FieldType::Uint32, 8))
                .optional_arg("var_string", FieldType::bounded_string(16))
                .optional_arg("var_bytes", FieldType::bounded_bytes(8)),
        )
}

fn add(args: Record) -> std::result::Result<Record, RemoteError> {
    let operand = |name: &str| {
        args.get(name)
            .and_then(|v| v.as_i64())
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| RemoteError::handler(format!("{} must be an int32", name)))
    };
    let sum = operand("a")?.wrapping_add(operand("b")?);
    Ok(Record::new().with("sum", sum))
}

fn handler_error(_args: Record) -> std::result::Result<Record, RemoteError> {
    Err(RemoteError::handler("handlererror always fails"))
}

fn set_struct(args: Record) -> std::result::Result<Record, RemoteError> {
    info!("setstruct: {}", args);
    Ok(Record::new())
}

/// Host `TestCallset` with its reference handlers on `server`.
pub async fn install(server: &Server) -> Result<()> {
    server.add_callset(definition()).await?;
    server.register_fn(NAME, ADD, add).await?;
    server.register_fn(NAME, HANDLER_ERROR, handler_error).await?;
    server.register_fn(NAME, SET_STRUCT, set_struct).await?;
    Ok(())
}

/// Connect, run the demo calls and close the connection on every path.
pub async fn run_client(config: &ClientConfig, no_reply: bool) -> Result<()> {
    // Fail on a bad address before touching the network.
    config.endpoint()?;

    let client = Client::connect(config).await?;
    let result = run_demo(&client, no_reply).await;

    info!("Closing connections on exit.");
    client.close().await;
    result
}

/// Call `add`, `handlererror` and `setstruct` in turn, logging each reply.
pub async fn run_demo(client: &Client, no_reply: bool) -> Result<()> {
    client.register(definition(), 1).await?;
    let test = client.callset(NAME).await?;

    let reply = test
        .invoke(ADD, Record::new().with("a", 1000i32).with("b", 2044i32))
        .await?;
    match reply.result().and_then(|r| r.get("sum")) {
        Some(sum) => info!("result: sum={}", sum),
        None => info!("result={}", reply),
    }

    let reply = test.invoke(HANDLER_ERROR, Record::new()).await?;
    info!("result={}", reply);

    let options = CallOptions {
        no_reply,
        ..CallOptions::default()
    };
    let reply = test.invoke_with(SET_STRUCT, demo_struct(), options).await?;
    info!("result={}", reply);
    Ok(())
}

/// Arguments of the `setstruct` call made by the demo client.
pub fn demo_struct() -> Record {
    Record::new()
        .with("var_int32", -55i32)
        .with("var_uint32", 40001230u32)
        .with("var_int64", 0x0000_beef_beef_beef_i64)
        .with("var_uint64", 0x55u64)
        .with("var_bool", true)
        .with("var_uint32_array", vec![0u32, 1, 23, 4, 5, 6, 8, 123456789])
        .with("var_string", "hello world, th")
        .with("var_bytes", b"asdfjkl;")
}
