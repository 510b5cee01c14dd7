//! Binary entry point. All real work lives in `pidgeon_lib`; this just
//! runs the async bootstrap and maps its result to a process exit code.

#[tokio::main]
async fn main() {
    let code = pidgeon_lib::run().await;
    std::process::exit(code);
}
