mod tests_dispatch;
