mod test_checkout;
mod test_init;
mod test_staging;
