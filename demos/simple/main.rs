use std::collections::HashMap;

pub fn main() {
    env_logger::init();

    let sdk_key = std::env::var("FLAGPOLE_SERVER_SDK_KEY").unwrap();
    let mut client = flagpole::Client::new(sdk_key, flagpole::Options::new()).unwrap();

    // Block waiting for configuration. Until the first configuration is
    // applied, every evaluation returns the default value.
    while !client.is_initialized() {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    let user = flagpole::User::new("test-user").with_custom_data(HashMap::new());

    // Evaluate a variable for test-user.
    let enabled = client
        .variable_value(&user, "a-boolean-flag", false.into())
        .unwrap()
        .as_boolean()
        // default value
        .unwrap_or(false);

    println!("Variable: {:?}", enabled);

    client.close();
}
