mod coordinator_tests;
mod rest_tests;
