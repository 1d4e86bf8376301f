mod tests_config;
