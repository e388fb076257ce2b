mod support;

mod envelope_tests;
