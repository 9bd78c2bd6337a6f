use log::error;
use serde::Serialize;

pub fn display_as_json<T: Serialize>(items: &[T]) {
    match serde_json::to_string_pretty(items) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Error converting to JSON: {}", e),
    }
}
