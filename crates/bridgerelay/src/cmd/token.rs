use bridgerelay_core::Token;
use serde::Serialize;

use crate::cmd::TokenArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_record, OutputFormat, Record};

#[derive(Serialize)]
struct TokenOutput {
    token: String,
}

impl Record for TokenOutput {
    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![("token", self.token.clone())]
    }
}

pub fn run(_args: TokenArgs, format: OutputFormat) -> CliResult<i32> {
    let output = TokenOutput {
        token: Token::generate().to_hex(),
    };
    print_record(&output, format);
    Ok(SUCCESS)
}
